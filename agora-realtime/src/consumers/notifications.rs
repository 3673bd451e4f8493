//! Forum notification feed (replies, mentions, quotes).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::BusEvent;
use crate::consumers::{Effect, GapTracker};
use crate::protocol::{ForumKind, ForumNotification};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub kind: ForumKind,
    pub notification: ForumNotification,
    pub read: bool,
    pub received_at: DateTime<Utc>,
}

/// Newest-first, de-duplicated by `notification_id`, capped at `capacity`.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    capacity: usize,
    items: VecDeque<FeedItem>,
    gaps: GapTracker,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
            gaps: GapTracker::default(),
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &FeedItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|i| !i.read).count()
    }

    pub fn mark_read(&mut self, notification_id: u64) -> bool {
        match self
            .items
            .iter_mut()
            .find(|i| i.notification.notification_id == notification_id)
        {
            Some(item) if !item.read => {
                item.read = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for item in &mut self.items {
            item.read = true;
        }
    }

    /// Replace the feed with a REST response, newest first.
    pub fn replace_from_rest(&mut self, items: Vec<FeedItem>) {
        self.items = items.into_iter().take(self.capacity).collect();
    }

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
        let Some((kind, notification)) = message.forum_notification() else {
            return Effect::Unchanged;
        };
        if self
            .items
            .iter()
            .any(|i| i.notification.notification_id == notification.notification_id)
        {
            return Effect::Unchanged;
        }
        self.items.push_front(FeedItem {
            kind,
            notification: notification.clone(),
            read: false,
            received_at: Utc::now(),
        });
        self.items.truncate(self.capacity);
        Effect::Updated
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::InboundMessage;

    fn forum(kind: &str, id: u64) -> BusEvent {
        let raw = json!({
            "type": kind,
            "notification_id": id,
            "thread_id": 1,
            "post_id": id * 10,
            "thread_title": "Garden club",
            "message": "someone replied",
            "actor": {"id": 4}
        });
        BusEvent::ConnectionMessage(InboundMessage::parse(&raw.to_string()).unwrap())
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut feed = NotificationFeed::new(10);
        assert_eq!(feed.apply(&forum("forum_reply", 1)), Effect::Updated);
        assert_eq!(feed.apply(&forum("forum_reply", 1)), Effect::Unchanged);
        assert_eq!(feed.apply(&forum("forum_mention", 2)), Effect::Updated);
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.items().next().unwrap().kind, ForumKind::Mention);
    }

    #[test]
    fn oldest_fall_off_past_capacity() {
        let mut feed = NotificationFeed::new(2);
        for id in 1..=3 {
            feed.apply(&forum("forum_quote", id));
        }
        let ids: Vec<u64> = feed.items().map(|i| i.notification.notification_id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn read_tracking() {
        let mut feed = NotificationFeed::new(10);
        feed.apply(&forum("forum_reply", 1));
        feed.apply(&forum("forum_reply", 2));
        assert_eq!(feed.unread_count(), 2);

        assert!(feed.mark_read(1));
        assert!(!feed.mark_read(1));
        assert!(!feed.mark_read(99));
        assert_eq!(feed.unread_count(), 1);

        feed.mark_all_read();
        assert_eq!(feed.unread_count(), 0);
    }

    #[test]
    fn non_forum_messages_are_ignored() {
        let mut feed = NotificationFeed::new(10);
        let ping = BusEvent::ConnectionMessage(InboundMessage::Ping);
        assert_eq!(feed.apply(&ping), Effect::Unchanged);
        assert!(feed.is_empty());
    }
}
