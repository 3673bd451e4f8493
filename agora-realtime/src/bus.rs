//! Process-wide publish/subscribe bus.
//!
//! The Broadcaster is the only publisher of [`BusEvent`]s; any number of
//! consumers subscribe. Control requests flow the other way on a separate
//! channel. Both are tokio broadcast channels, so a subscriber that falls
//! behind sees `RecvError::Lagged` and must reconcile over REST.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::protocol::InboundMessage;
use crate::state::{AuthError, ConnectionState};

const DEFAULT_CAPACITY: usize = 256;
const ENVELOPE_VERSION: u32 = 1;

/// Events republished from the shared Client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum BusEvent {
    /// Full state snapshot.
    ConnectionState(ConnectionState),
    /// One inbound frame, verbatim.
    ConnectionMessage(InboundMessage),
    Connected,
    Disconnected { reason: String },
    AuthError(AuthError),
}

/// Versioned wrapper around every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// Strictly increasing per bus, in delivery order.
    pub seq: u64,
    pub timestamp_ms: i64,
    pub event: BusEvent,
}

/// Requests accepted by the Broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Tear down and recreate the Client with the latest token.
    RequestReconnect,
    /// Tear down without recreating.
    RequestDisconnect,
    /// Re-publish the current state snapshot.
    RequestState,
}

pub struct Bus {
    events: broadcast::Sender<Envelope>,
    control: broadcast::Sender<ControlRequest>,
    /// Held across numbering and sending so `seq` matches delivery order.
    next_seq: Mutex<u64>,
    dropped: AtomicU64,
}

impl Default for Bus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity).0,
            control: broadcast::channel(capacity).0,
            next_seq: Mutex::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    /// Publish `event`, returning its sequence number. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, event: BusEvent) -> u64 {
        let mut next_seq = self.next_seq.lock();
        *next_seq += 1;
        let seq = *next_seq;
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event,
        };
        if self.events.send(envelope).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        seq
    }

    /// Events published while nobody was subscribed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlRequest> {
        self.control.subscribe()
    }

    /// Send a control request. Returns false if no Broadcaster is listening.
    pub fn request(&self, request: ControlRequest) -> bool {
        match self.control.send(request) {
            Ok(_) => true,
            Err(_) => {
                tracing::debug!(?request, "control request with no broadcaster listening");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_sequence() {
        let bus = Bus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(BusEvent::Connected);
        bus.publish(BusEvent::ConnectionMessage(InboundMessage::Pong));

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert_eq!(first.event, BusEvent::Connected);
            assert_eq!(first.seq + 1, second.seq);
            assert_eq!(second.version, 1);
        }
    }

    #[test]
    fn publish_without_subscribers_is_counted() {
        let bus = Bus::new();
        assert_eq!(bus.publish(BusEvent::Connected), 1);
        assert_eq!(bus.dropped(), 1);
        assert!(!bus.request(ControlRequest::RequestState));
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope {
            version: 1,
            seq: 7,
            timestamp_ms: 0,
            event: BusEvent::Disconnected {
                reason: "bye".into(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"]["type"], "disconnected");
        assert_eq!(json["event"]["data"]["reason"], "bye");

        let state = serde_json::to_value(BusEvent::ConnectionState(ConnectionState::default())).unwrap();
        assert_eq!(state["type"], "connection-state");
        assert_eq!(state["data"]["is_connected"], false);

        assert_eq!(
            serde_json::to_string(&ControlRequest::RequestReconnect).unwrap(),
            r#""request-reconnect""#
        );
    }
}
