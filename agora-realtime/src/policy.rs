//! Auth-Error Policy: refresh and resume, or log out.
//!
//! This is the only component allowed to end the session. Transport and
//! liveness failures never lead to logout here; the Client's own backoff
//! governs those.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::SessionStore;
use crate::state::{AuthError, AuthErrorKind};

pub struct AuthErrorPolicy {
    store: Arc<dyn SessionStore>,
    dismissed: Mutex<HashSet<String>>,
    /// One refresh at a time; concurrent errors queue behind it.
    refreshing: tokio::sync::Mutex<()>,
}

impl AuthErrorPolicy {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            dismissed: Mutex::new(HashSet::new()),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    /// Decide what to do about `error`.
    ///
    /// Returns `true` when the session was recovered and the connection
    /// should resume with the store's current token, `false` otherwise.
    /// Only authentication failures can trigger a logout.
    pub async fn handle_auth_error(&self, error: &AuthError) -> bool {
        match error.kind {
            AuthErrorKind::TokenExpired => {
                let _refreshing = self.refreshing.lock().await;
                match self.store.refresh().await {
                    Ok(_) => {
                        tracing::info!("session refreshed after token expiry");
                        self.clear_dismissed_errors();
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "token refresh failed, logging out");
                        self.store.logout().await;
                        false
                    }
                }
            }
            AuthErrorKind::TokenRefreshFailed => {
                tracing::warn!(reason = %error.message, "server refused token refresh, logging out");
                self.store.logout().await;
                false
            }
            AuthErrorKind::ConnectionLost | AuthErrorKind::HeartbeatTimeout => {
                tracing::debug!(
                    kind = %error.kind,
                    category = ?error.category(),
                    "not an authentication failure; leaving session intact"
                );
                false
            }
            AuthErrorKind::Unknown => {
                tracing::warn!(reason = %error.message, "unknown auth error type");
                false
            }
        }
    }

    /// Renew the access token before the server expires it.
    ///
    /// Returns the new token for an in-band swap. A failure does not log
    /// out: the current token is still valid, and if it does run out the
    /// server reports `token_expired`, which goes through
    /// [`handle_auth_error`](Self::handle_auth_error).
    pub async fn refresh_before_expiry(&self) -> Option<String> {
        let _refreshing = self.refreshing.lock().await;
        match self.store.refresh().await {
            Ok(tokens) => {
                tracing::info!("access token renewed ahead of expiry");
                Some(tokens.access)
            }
            Err(e) => {
                tracing::warn!(error = %e, "early token refresh failed; keeping current token");
                None
            }
        }
    }

    pub fn dismiss_error(&self, id: &str) {
        self.dismissed.lock().insert(id.to_string());
    }

    pub fn is_error_dismissed(&self, id: &str) -> bool {
        self.dismissed.lock().contains(id)
    }

    pub fn clear_dismissed_errors(&self) {
        self.dismissed.lock().clear();
    }

    /// Whether the UI should surface `error`.
    pub fn should_display(&self, error: &AuthError) -> bool {
        !self.is_error_dismissed(&error.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;

    fn policy_with(store: &Arc<MemorySessionStore>) -> AuthErrorPolicy {
        AuthErrorPolicy::new(store.clone())
    }

    #[tokio::test]
    async fn expired_token_with_good_refresh_recovers() {
        let store = Arc::new(MemorySessionStore::new(Some("tok1")));
        store.push_refresh_outcome(Ok("tok2"));
        let policy = policy_with(&store);

        assert!(policy.handle_auth_error(&AuthError::token_expired("4001")).await);
        assert_eq!(store.access_token().as_deref(), Some("tok2"));
        assert_eq!(store.logout_count(), 0);
    }

    #[tokio::test]
    async fn expired_token_with_bad_refresh_logs_out_once() {
        let store = Arc::new(MemorySessionStore::new(Some("tok1")));
        store.push_refresh_outcome(Err("refresh token revoked"));
        let policy = policy_with(&store);

        assert!(!policy.handle_auth_error(&AuthError::token_expired("4001")).await);
        assert_eq!(store.logout_count(), 1);
        assert_eq!(store.refresh_count(), 1);
    }

    #[tokio::test]
    async fn refresh_failed_never_refreshes() {
        let store = Arc::new(MemorySessionStore::new(Some("tok1")));
        store.push_refresh_outcome(Ok("tok2"));
        let policy = policy_with(&store);

        assert!(
            !policy
                .handle_auth_error(&AuthError::token_refresh_failed("nope"))
                .await
        );
        assert_eq!(store.refresh_count(), 0);
        assert_eq!(store.logout_count(), 1);
    }

    #[tokio::test]
    async fn transport_failures_keep_the_session() {
        let store = Arc::new(MemorySessionStore::new(Some("tok1")));
        let policy = policy_with(&store);

        assert!(!policy.handle_auth_error(&AuthError::connection_lost(5)).await);
        assert!(!policy.handle_auth_error(&AuthError::heartbeat_timeout(2)).await);
        assert_eq!(store.logout_count(), 0);
        assert_eq!(store.refresh_count(), 0);
        assert_eq!(store.access_token().as_deref(), Some("tok1"));
    }

    #[tokio::test]
    async fn unknown_kind_is_declined() {
        let store = Arc::new(MemorySessionStore::new(Some("tok1")));
        let policy = policy_with(&store);
        let mut error = AuthError::connection_lost(1);
        error.kind = AuthErrorKind::Unknown;

        assert!(!policy.handle_auth_error(&error).await);
        assert_eq!(store.logout_count(), 0);
    }

    #[tokio::test]
    async fn early_refresh_failure_keeps_the_session() {
        let store = Arc::new(MemorySessionStore::new(Some("tok1")));
        store.push_refresh_outcome(Ok("tok2"));
        store.push_refresh_outcome(Err("refresh endpoint down"));
        let policy = policy_with(&store);

        assert_eq!(policy.refresh_before_expiry().await.as_deref(), Some("tok2"));
        assert_eq!(policy.refresh_before_expiry().await, None);
        assert_eq!(store.refresh_count(), 2);
        assert_eq!(store.logout_count(), 0);
        assert_eq!(store.access_token().as_deref(), Some("tok2"));
    }

    #[test]
    fn dismissal_is_per_error_class() {
        let store = Arc::new(MemorySessionStore::new(None));
        let policy = policy_with(&store);
        let first = AuthError::heartbeat_timeout(2);
        let again = AuthError::heartbeat_timeout(3);

        assert!(policy.should_display(&first));
        policy.dismiss_error(&first.id());
        policy.dismiss_error(&first.id());
        assert!(policy.is_error_dismissed(&again.id()));
        assert!(!policy.should_display(&again));
        assert!(policy.should_display(&AuthError::connection_lost(5)));

        policy.clear_dismissed_errors();
        assert!(policy.should_display(&again));
    }
}
