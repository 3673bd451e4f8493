//! The session/token store the real-time layer depends on.
//!
//! The Client reads the access token when it connects; the Auth-Error Policy
//! asks the store to refresh it or to log out. Implementations must make
//! token replacement atomic with respect to readers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Access token plus the credential used to renew it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current access token, if a session exists.
    fn access_token(&self) -> Option<String>;

    /// Obtain and store a new access token.
    async fn refresh(&self) -> Result<TokenPair, SessionError>;

    /// End the session locally.
    async fn logout(&self);
}

/// Store that renews tokens against the REST API.
///
/// `POST {api_base_url}/auth/token/refresh/` with `{"refresh": ...}`,
/// answered by `{"access": ..., "refresh"?: ...}`.
pub struct HttpSessionStore {
    http: reqwest::Client,
    refresh_url: String,
    tokens: RwLock<Option<TokenPair>>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

impl HttpSessionStore {
    pub fn new(api_base_url: &str, tokens: Option<TokenPair>) -> Self {
        Self::with_client(api_base_url, tokens, reqwest::Client::new())
    }

    pub fn with_client(api_base_url: &str, tokens: Option<TokenPair>, http: reqwest::Client) -> Self {
        Self {
            http,
            refresh_url: format!("{}/auth/token/refresh/", api_base_url.trim_end_matches('/')),
            tokens: RwLock::new(tokens),
        }
    }

    pub fn set_tokens(&self, tokens: Option<TokenPair>) {
        *self.tokens.write() = tokens;
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access.clone())
    }

    #[tracing::instrument(skip_all)]
    async fn refresh(&self) -> Result<TokenPair, SessionError> {
        let refresh = self
            .tokens
            .read()
            .as_ref()
            .and_then(|t| t.refresh.clone())
            .ok_or(SessionError::NoRefreshToken)?;

        let body = serde_json::json!({ "refresh": refresh });
        let resp = self.http.post(&self.refresh_url).json(&body).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SessionError::Rejected { status, message });
        }

        let data: RefreshResponse = resp.json().await?;
        let pair = TokenPair {
            access: data.access,
            refresh: data.refresh.or(Some(refresh)),
        };
        *self.tokens.write() = Some(pair.clone());
        tracing::debug!("access token renewed");
        Ok(pair)
    }

    async fn logout(&self) {
        *self.tokens.write() = None;
    }
}

/// In-memory store with scripted refresh outcomes.
///
/// Each `refresh` pops the next outcome: `Ok(access)` installs a new token,
/// `Err(message)` fails with [`SessionError::Rejected`]. With nothing
/// scripted, refresh fails.
#[derive(Default)]
pub struct MemorySessionStore {
    tokens: RwLock<Option<TokenPair>>,
    outcomes: Mutex<VecDeque<Result<String, String>>>,
    refreshes: AtomicUsize,
    logouts: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new(access: Option<&str>) -> Self {
        let store = Self::default();
        store.set_access_token(access);
        store
    }

    pub fn set_access_token(&self, access: Option<&str>) {
        *self.tokens.write() = access.map(|a| TokenPair {
            access: a.to_string(),
            refresh: Some(format!("refresh-for-{a}")),
        });
    }

    pub fn push_refresh_outcome(&self, outcome: Result<&str, &str>) {
        self.outcomes
            .lock()
            .push_back(outcome.map(str::to_string).map_err(str::to_string));
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access.clone())
    }

    async fn refresh(&self) -> Result<TokenPair, SessionError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().pop_front();
        match outcome {
            Some(Ok(access)) => {
                let pair = TokenPair {
                    access: access.clone(),
                    refresh: Some(format!("refresh-for-{access}")),
                };
                *self.tokens.write() = Some(pair.clone());
                Ok(pair)
            }
            Some(Err(message)) => Err(SessionError::Rejected {
                status: 401,
                message,
            }),
            None => Err(SessionError::NoRefreshToken),
        }
    }

    async fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        *self.tokens.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_url_is_joined_once() {
        let store = HttpSessionStore::new("https://agora.example.org/api/", None);
        assert_eq!(
            store.refresh_url,
            "https://agora.example.org/api/auth/token/refresh/"
        );
    }

    #[tokio::test]
    async fn http_refresh_without_refresh_token_fails_locally() {
        let store = HttpSessionStore::new("http://127.0.0.1:9", None);
        assert!(matches!(
            store.refresh().await,
            Err(SessionError::NoRefreshToken)
        ));
    }

    #[tokio::test]
    async fn memory_store_follows_script() {
        let store = MemorySessionStore::new(Some("tok1"));
        store.push_refresh_outcome(Ok("tok2"));
        store.push_refresh_outcome(Err("revoked"));

        assert_eq!(store.refresh().await.unwrap().access, "tok2");
        assert_eq!(store.access_token().as_deref(), Some("tok2"));
        assert!(store.refresh().await.is_err());
        assert_eq!(store.refresh_count(), 2);

        store.logout().await;
        assert_eq!(store.access_token(), None);
        assert_eq!(store.logout_count(), 1);
    }
}
