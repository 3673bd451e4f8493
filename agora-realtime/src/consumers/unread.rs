//! Unread message counts.

use crate::bus::BusEvent;
use crate::consumers::{Effect, GapTracker};
use crate::protocol::{ConversationUnread, ConversationId, InboundMessage, UnreadCount, UserId};

/// Unread totals for one signed-in user.
#[derive(Debug, Clone)]
pub struct UnreadCounts {
    me: UserId,
    counts: UnreadCount,
    gaps: GapTracker,
}

impl UnreadCounts {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            counts: UnreadCount::default(),
            gaps: GapTracker::default(),
        }
    }

    pub fn snapshot(&self) -> &UnreadCount {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.total_unread
    }

    pub fn for_conversation(&self, conversation_id: ConversationId) -> u64 {
        self.counts
            .conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
            .map_or(0, |c| c.unread_count)
    }

    /// Replace everything with a REST response.
    pub fn replace_from_rest(&mut self, counts: UnreadCount) {
        self.counts = counts;
    }

    /// Events were lost; the counts can't be trusted until reloaded.
    pub fn on_lagged(&mut self) -> Effect {
        Effect::Refetch
    }

    pub fn apply(&mut self, event: &BusEvent) -> Effect {
        if self.gaps.observe(event) {
            return Effect::Refetch;
        }
        let BusEvent::ConnectionMessage(message) = event else {
            return Effect::Unchanged;
        };
        match message {
            InboundMessage::UnreadCountUpdate { data } => {
                self.counts = data.clone();
                Effect::Updated
            }
            InboundMessage::NewMessage(new) if new.message.sender.id != self.me => {
                self.bump(new.conversation_id);
                Effect::Updated
            }
            InboundMessage::MessagesRead {
                user_id,
                conversation_id,
            } if *user_id == self.me => self.clear(*conversation_id),
            _ => Effect::Unchanged,
        }
    }

    fn bump(&mut self, conversation_id: ConversationId) {
        self.counts.total_unread += 1;
        match self
            .counts
            .conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
        {
            Some(entry) => entry.unread_count += 1,
            None => self.counts.conversations.push(ConversationUnread {
                conversation_id,
                unread_count: 1,
            }),
        }
    }

    fn clear(&mut self, conversation_id: ConversationId) -> Effect {
        let Some(entry) = self
            .counts
            .conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
        else {
            return Effect::Unchanged;
        };
        if entry.unread_count == 0 {
            return Effect::Unchanged;
        }
        self.counts.total_unread = self.counts.total_unread.saturating_sub(entry.unread_count);
        entry.unread_count = 0;
        Effect::Updated
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ME: UserId = 1;

    fn message(raw: serde_json::Value) -> BusEvent {
        BusEvent::ConnectionMessage(InboundMessage::parse(&raw.to_string()).unwrap())
    }

    fn new_message(conversation_id: u64, sender: u64) -> BusEvent {
        message(json!({
            "type": "new_message",
            "conversation_id": conversation_id,
            "message": {"content": "hi", "sender": {"id": sender}}
        }))
    }

    #[test]
    fn messages_from_others_increment() {
        let mut unread = UnreadCounts::new(ME);
        assert_eq!(unread.apply(&new_message(10, 2)), Effect::Updated);
        assert_eq!(unread.apply(&new_message(10, 3)), Effect::Updated);
        assert_eq!(unread.apply(&new_message(11, 2)), Effect::Updated);
        assert_eq!(unread.apply(&new_message(10, ME)), Effect::Unchanged);

        assert_eq!(unread.total(), 3);
        assert_eq!(unread.for_conversation(10), 2);
        assert_eq!(unread.for_conversation(11), 1);
    }

    #[test]
    fn own_read_receipt_clears_conversation() {
        let mut unread = UnreadCounts::new(ME);
        unread.apply(&new_message(10, 2));
        unread.apply(&new_message(11, 2));

        let others_read = message(json!({"type": "messages_read", "user_id": 2, "conversation_id": 10}));
        assert_eq!(unread.apply(&others_read), Effect::Unchanged);

        let i_read = message(json!({"type": "messages_read", "user_id": ME, "conversation_id": 10}));
        assert_eq!(unread.apply(&i_read), Effect::Updated);
        assert_eq!(unread.for_conversation(10), 0);
        assert_eq!(unread.total(), 1);
        assert_eq!(unread.apply(&i_read), Effect::Unchanged);
    }

    #[test]
    fn server_update_replaces_counts() {
        let mut unread = UnreadCounts::new(ME);
        unread.apply(&new_message(10, 2));
        let update = message(json!({
            "type": "unread_count_update",
            "data": {"total_unread": 7, "conversations": [{"conversation_id": 4, "unread_count": 7}]}
        }));
        assert_eq!(unread.apply(&update), Effect::Updated);
        assert_eq!(unread.total(), 7);
        assert_eq!(unread.for_conversation(10), 0);
        assert_eq!(unread.for_conversation(4), 7);
    }

    #[test]
    fn reconnect_after_gap_asks_for_refetch() {
        let mut unread = UnreadCounts::new(ME);
        assert_eq!(unread.apply(&BusEvent::Connected), Effect::Unchanged);
        unread.apply(&BusEvent::Disconnected {
            reason: "heartbeat timeout".into(),
        });
        assert_eq!(unread.apply(&BusEvent::Connected), Effect::Refetch);
        assert_eq!(unread.apply(&BusEvent::Connected), Effect::Unchanged);

        unread.replace_from_rest(UnreadCount {
            total_unread: 2,
            conversations: vec![ConversationUnread {
                conversation_id: 9,
                unread_count: 2,
            }],
        });
        assert_eq!(unread.for_conversation(9), 2);
    }
}
