//! Connection state snapshot and the errors the Client reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read-only snapshot of the Client's connection.
///
/// Invariants: `is_connected` and `is_reconnecting` are never both set, and
/// `reconnect_attempts` is 0 whenever `is_connected` is set. The mutators
/// below are the only way the Client changes a snapshot, and each keeps both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_reconnecting: bool,
    pub reconnect_attempts: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub token_expiring: bool,
    pub token_expires_in: Option<u64>,
    pub auth_error: Option<AuthError>,
}

impl ConnectionState {
    pub(crate) fn mark_connected(&mut self) {
        self.is_connected = true;
        self.is_reconnecting = false;
        self.reconnect_attempts = 0;
        self.auth_error = None;
    }

    pub(crate) fn mark_reconnecting(&mut self, attempt: u32) {
        self.is_connected = false;
        self.is_reconnecting = true;
        self.reconnect_attempts = attempt;
    }

    /// Socket gone and no retry pending. Token bookkeeping is kept so the
    /// UI can still show an expiry warning.
    pub(crate) fn mark_disconnected(&mut self) {
        self.is_connected = false;
        self.is_reconnecting = false;
        self.reconnect_attempts = 0;
    }

    pub(crate) fn token_refreshed(&mut self, expires_in: Option<u64>) {
        self.token_expiring = false;
        self.token_expires_in = expires_in;
        self.auth_error = None;
    }
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    TokenExpired,
    TokenRefreshFailed,
    ConnectionLost,
    HeartbeatTimeout,
    /// Received from a peer that speaks a newer taxonomy.
    #[serde(other)]
    Unknown,
}

/// Which layer a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Socket trouble with no credential implication.
    Transport,
    /// Heartbeat acks stopped arriving.
    Liveness,
    /// The server no longer accepts the session.
    Authentication,
    Unknown,
}

impl AuthErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthErrorKind::TokenExpired => "token_expired",
            AuthErrorKind::TokenRefreshFailed => "token_refresh_failed",
            AuthErrorKind::ConnectionLost => "connection_lost",
            AuthErrorKind::HeartbeatTimeout => "heartbeat_timeout",
            AuthErrorKind::Unknown => "unknown",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            AuthErrorKind::TokenExpired | AuthErrorKind::TokenRefreshFailed => {
                ErrorCategory::Authentication
            }
            AuthErrorKind::ConnectionLost => ErrorCategory::Transport,
            AuthErrorKind::HeartbeatTimeout => ErrorCategory::Liveness,
            AuthErrorKind::Unknown => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// A connection failure surfaced to the Auth-Error Policy and the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthError {
    #[serde(rename = "type")]
    pub kind: AuthErrorKind,
    pub message: String,
    pub can_retry: bool,
    pub severity: Severity,
}

impl AuthError {
    pub fn token_expired(message: impl Into<String>) -> Self {
        Self {
            kind: AuthErrorKind::TokenExpired,
            message: message.into(),
            can_retry: true,
            severity: Severity::Medium,
        }
    }

    pub fn token_refresh_failed(message: impl Into<String>) -> Self {
        Self {
            kind: AuthErrorKind::TokenRefreshFailed,
            message: message.into(),
            can_retry: false,
            severity: Severity::High,
        }
    }

    pub fn connection_lost(attempts: u32) -> Self {
        Self {
            kind: AuthErrorKind::ConnectionLost,
            message: format!("Connection lost after {attempts} reconnect attempts"),
            can_retry: false,
            severity: Severity::High,
        }
    }

    pub fn heartbeat_timeout(missed: u32) -> Self {
        Self {
            kind: AuthErrorKind::HeartbeatTimeout,
            message: format!("No heartbeat acknowledgement for {missed} consecutive heartbeats"),
            can_retry: true,
            severity: Severity::Medium,
        }
    }

    /// Identity of the error class, used to suppress repeat displays.
    pub fn id(&self) -> String {
        format!("{}-{}", self.kind, self.severity.as_str())
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_clears_reconnect_bookkeeping() {
        let mut state = ConnectionState::default();
        state.mark_reconnecting(3);
        assert!(state.is_reconnecting);
        assert_eq!(state.reconnect_attempts, 3);

        state.mark_connected();
        assert!(state.is_connected);
        assert!(!state.is_reconnecting);
        assert_eq!(state.reconnect_attempts, 0);
    }

    #[test]
    fn kinds_fall_into_categories() {
        assert_eq!(
            AuthErrorKind::TokenExpired.category(),
            ErrorCategory::Authentication
        );
        assert_eq!(AuthErrorKind::ConnectionLost.category(), ErrorCategory::Transport);
        assert_eq!(AuthErrorKind::HeartbeatTimeout.category(), ErrorCategory::Liveness);
    }

    #[test]
    fn id_depends_on_kind_and_severity_only() {
        let a = AuthError::heartbeat_timeout(2);
        let mut b = AuthError::heartbeat_timeout(5);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), "heartbeat_timeout-medium");
        b.severity = Severity::High;
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn auth_error_wire_shape() {
        let json = serde_json::to_value(AuthError::connection_lost(5)).unwrap();
        assert_eq!(json["type"], "connection_lost");
        assert_eq!(json["can_retry"], false);
        assert_eq!(json["severity"], "high");

        let parsed: AuthError = serde_json::from_value(serde_json::json!({
            "type": "session_revoked",
            "message": "x",
            "can_retry": false,
            "severity": "high"
        }))
        .unwrap();
        assert_eq!(parsed.kind, AuthErrorKind::Unknown);
    }
}
