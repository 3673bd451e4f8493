//! Error types for the real-time layer.
//!
//! None of these cross the public [`Client`](crate::client::Client) surface at
//! runtime: transport failures become emitted events, validation failures are
//! returned to the sender. They exist for construction, collaborator traits and
//! the send path.

use std::time::Duration;

use thiserror::Error;

/// Invalid or unusable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid api base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("can't read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Failure reported by a [`Transport`](crate::transport::Transport) or
/// [`Connector`](crate::transport::Connector).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server refused the credential, either at the handshake or with an
    /// application close code.
    #[error("server rejected credentials: {0}")]
    Unauthorized(String),
    #[error("connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("websocket error: {0}")]
    Socket(String),
}

impl TransportError {
    /// Whether this failure means the access token is no longer accepted.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// Failure reported by a [`SessionStore`](crate::session::SessionStore).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("refresh rejected: {status} {message}")]
    Rejected { status: u16, message: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Why outbound message content was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("Message cannot be empty")]
    Empty,
    #[error("Message is too long ({len} characters, maximum {max})")]
    TooLong { len: usize, max: usize },
}

/// Why an outbound send was blocked before reaching the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error(transparent)]
    Invalid(#[from] ContentError),
    #[error("You're sending messages too quickly. Try again in {} seconds.", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },
}

impl SendRejection {
    /// Countdown to show the user, if waiting would help.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendRejection::RateLimited { retry_after } => Some(*retry_after),
            SendRejection::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unauthorized_counts_as_auth() {
        assert!(TransportError::Unauthorized("401".into()).is_auth());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_auth());
        assert!(
            !TransportError::Closed {
                code: 1006,
                reason: String::new()
            }
            .is_auth()
        );
    }

    #[test]
    fn content_error_messages_are_user_facing() {
        let err = ContentError::TooLong { len: 5001, max: 5000 };
        assert_eq!(
            err.to_string(),
            "Message is too long (5001 characters, maximum 5000)"
        );
        assert_eq!(ContentError::Empty.to_string(), "Message cannot be empty");
    }
}
