//! Authenticated real-time connection layer for Agora.
//!
//! One [`Client`] keeps a heartbeat-checked WebSocket to the per-user
//! channel and reconnects with capped backoff. The [`Broadcaster`] owns the
//! single Client of a session and republishes its events on a [`Bus`];
//! consumers derive unread counts and notification feeds from it. Auth
//! failures go to the [`AuthErrorPolicy`], which refreshes the token through
//! a [`SessionStore`] or ends the session.

pub mod broadcaster;
pub mod bus;
pub mod client;
pub mod config;
pub mod consumers;
pub mod error;
pub mod event;
pub mod guard;
pub mod policy;
pub mod protocol;
pub mod ratelimit;
pub mod session;
pub mod state;
pub mod transport;
pub mod validation;

pub use broadcaster::{Broadcaster, MountGuard};
pub use bus::{Bus, BusEvent, ControlRequest, Envelope};
pub use client::{Client, ListenerId};
pub use config::RealtimeConfig;
pub use event::{ClientEvent, EventKind};
pub use guard::OutboundGuard;
pub use policy::AuthErrorPolicy;
pub use protocol::InboundMessage;
pub use session::{HttpSessionStore, MemorySessionStore, SessionStore, TokenPair};
pub use state::{AuthError, AuthErrorKind, ConnectionState, ErrorCategory, Severity};
