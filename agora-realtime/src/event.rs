//! Events emitted by the Client for its listeners.

use serde::{Deserialize, Serialize};

use crate::protocol::InboundMessage;
use crate::state::{AuthError, ConnectionState};

/// Events that the Client emits to registered listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Socket open and usable.
    Connected,
    /// A previously open (or reconnecting) connection went away.
    Disconnected { reason: String },
    /// Full snapshot after any state mutation.
    StateChange(ConnectionState),
    AuthError(AuthError),
    /// Inbound frame, passed through without interpretation.
    Message(InboundMessage),
}

/// Subscription key for [`ClientEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Connected,
    Disconnected,
    StateChange,
    AuthError,
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::StateChange,
        EventKind::AuthError,
        EventKind::Message,
    ];
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::Disconnected { .. } => EventKind::Disconnected,
            ClientEvent::StateChange(_) => EventKind::StateChange,
            ClientEvent::AuthError(_) => EventKind::AuthError,
            ClientEvent::Message(_) => EventKind::Message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_line_up_with_variants() {
        assert_eq!(ClientEvent::Connected.kind(), EventKind::Connected);
        assert_eq!(
            ClientEvent::Message(InboundMessage::Pong).kind(),
            EventKind::Message
        );
        assert_eq!(
            serde_json::to_string(&EventKind::StateChange).unwrap(),
            r#""state-change""#
        );
    }
}
