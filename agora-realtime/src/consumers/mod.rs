//! Derived state built from the bus.
//!
//! Consumers are plain reducers: the host feeds them bus events and acts on
//! the returned [`Effect`]. They never touch the Client.

pub mod notifications;
pub mod unread;

use crate::bus::BusEvent;

/// What the host should do after a consumer applied an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Unchanged,
    Updated,
    /// The stream had a gap; reload the aggregate over REST.
    Refetch,
}

/// Tracks whether a `connected` event closes a gap in the stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct GapTracker {
    gap: bool,
}

impl GapTracker {
    /// Returns true when the event reconnects after a disconnection.
    pub(crate) fn observe(&mut self, event: &BusEvent) -> bool {
        match event {
            BusEvent::Disconnected { .. } => {
                self.gap = true;
                false
            }
            BusEvent::ConnectionState(state) if state.is_reconnecting => {
                self.gap = true;
                false
            }
            BusEvent::Connected => std::mem::take(&mut self.gap),
            _ => false,
        }
    }
}
