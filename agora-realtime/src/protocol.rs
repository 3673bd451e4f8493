//! JSON-over-WebSocket wire messages.
//!
//! Every frame is a JSON object discriminated by its `type` field. Control
//! messages drive the connection itself; application messages are passed
//! through untouched for the consumers. A frame whose payload does not fit
//! its typed variant is still delivered, as [`InboundMessage::Unknown`] with
//! the raw JSON.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type ConversationId = u64;
pub type UserId = u64;

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Heartbeat,
    RefreshToken { token: String },
    Pong,
}

impl OutboundMessage {
    pub fn to_json(&self) -> String {
        // Unit and string-only variants always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    HeartbeatAck,
    TokenRefreshed {
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_in: Option<u64>,
    },
    TokenRefreshFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TokenExpiring {
        expires_in: u64,
    },
    NewMessage(NewMessage),
    MessagesRead {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    UnreadCountUpdate {
        data: UnreadCount,
    },
    ForumReply(ForumNotification),
    ForumMention(ForumNotification),
    ForumQuote(ForumNotification),
    Ping,
    Pong,
    /// A `type` this build does not know about, or a payload it could not
    /// read. `raw` is the whole frame as received.
    #[serde(skip_deserializing)]
    Unknown { raw: Value },
}

fn default_true() -> bool {
    true
}

/// `null` and a missing field both mean the default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl InboundMessage {
    /// Parse one frame.
    ///
    /// Fails only for text that is not a JSON object with a string `type`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: Value = serde_json::from_str(text)?;
        if !raw.get("type").is_some_and(Value::is_string) {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "frame has no string `type` field",
            ));
        }
        match Self::deserialize(&raw) {
            Ok(message) => Ok(message),
            Err(e) => {
                tracing::debug!(error = %e, kind = ?raw["type"], "passing frame through untyped");
                Ok(InboundMessage::Unknown { raw })
            }
        }
    }

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::HeartbeatAck => "heartbeat_ack",
            InboundMessage::TokenRefreshed { .. } => "token_refreshed",
            InboundMessage::TokenRefreshFailed { .. } => "token_refresh_failed",
            InboundMessage::TokenExpiring { .. } => "token_expiring",
            InboundMessage::NewMessage(_) => "new_message",
            InboundMessage::MessagesRead { .. } => "messages_read",
            InboundMessage::UnreadCountUpdate { .. } => "unread_count_update",
            InboundMessage::ForumReply(_) => "forum_reply",
            InboundMessage::ForumMention(_) => "forum_mention",
            InboundMessage::ForumQuote(_) => "forum_quote",
            InboundMessage::Ping => "ping",
            InboundMessage::Pong => "pong",
            InboundMessage::Unknown { .. } => "unknown",
        }
    }

    /// Forum notification payload, if this is one of the `forum_*` kinds.
    pub fn forum_notification(&self) -> Option<(ForumKind, &ForumNotification)> {
        match self {
            InboundMessage::ForumReply(n) => Some((ForumKind::Reply, n)),
            InboundMessage::ForumMention(n) => Some((ForumKind::Mention, n)),
            InboundMessage::ForumQuote(n) => Some((ForumKind::Quote, n)),
            _ => None,
        }
    }
}

/// `new_message` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    /// Remaining fields (id, timestamps, attachments) for the UI.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Unread totals for the current user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub total_unread: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversations: Vec<ConversationUnread>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUnread {
    pub conversation_id: ConversationId,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForumKind {
    Reply,
    Mention,
    Quote,
}

/// Payload shared by `forum_reply`, `forum_mention` and `forum_quote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForumNotification {
    pub notification_id: u64,
    pub thread_id: u64,
    pub post_id: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub thread_title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    /// Who triggered it; shape is owned by the server.
    #[serde(default)]
    pub actor: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_post_id: Option<u64>,
}
