//! The socket seam.
//!
//! The Client talks to a [`Connector`] that produces boxed [`Transport`]s.
//! [`ws::WsConnector`] is the production WebSocket implementation;
//! [`memory`] is an in-process pair for tests and embedding hosts.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use url::Url;

use crate::error::TransportError;

/// One open text-frame connection.
///
/// `recv` must be cancel-safe: the Client polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame. `None` once the peer has gone away cleanly.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Best-effort close handshake.
    async fn close(&mut self);
}

/// Opens [`Transport`]s. `url` already carries the access token.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError>;
}

/// Close codes servers use to reject a credential mid-session.
pub(crate) fn is_auth_close_code(code: u16) -> bool {
    matches!(code, 4001 | 4003 | 4401 | 4403)
}
