//! In-process transport pair.
//!
//! [`memory_transport`] returns a [`MemoryConnector`] to hand to a Client and
//! the [`MemoryServer`] side that accepts its connections, scripts refusals
//! and exchanges frames. Everything runs on tokio channels, so tests can use
//! a paused clock.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{Connector, Transport};
use crate::error::TransportError;

type ToClient = mpsc::UnboundedSender<Result<String, TransportError>>;

struct Inner {
    refusals: Mutex<VecDeque<TransportError>>,
    refuse_all: Mutex<Option<TransportError>>,
    attempts: Mutex<Vec<Url>>,
    accepted: mpsc::UnboundedSender<ServerConn>,
}

/// Client half: pass to [`Client::with_connector`](crate::client::Client::with_connector).
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

/// Server half.
pub struct MemoryServer {
    inner: Arc<Inner>,
    accepted_rx: mpsc::UnboundedReceiver<ServerConn>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let (accepted, accepted_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(Inner {
        refusals: Mutex::new(VecDeque::new()),
        refuse_all: Mutex::new(None),
        attempts: Mutex::new(Vec::new()),
        accepted,
    });
    (
        MemoryConnector {
            inner: inner.clone(),
        },
        MemoryServer { inner, accepted_rx },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        self.inner.attempts.lock().push(url.clone());

        if let Some(err) = self.inner.refusals.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.inner.refuse_all.lock().clone() {
            return Err(err);
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned());
        let conn = ServerConn {
            token,
            to_client: Some(to_client),
            from_client,
        };
        self.inner
            .accepted
            .send(conn)
            .map_err(|_| TransportError::Socket("memory server dropped".into()))?;

        Ok(Box::new(MemoryTransport {
            to_server,
            from_server,
        }))
    }
}

impl MemoryServer {
    /// Next accepted connection.
    pub async fn accept(&mut self) -> Option<ServerConn> {
        self.accepted_rx.recv().await
    }

    /// Accepted connection, if one is already waiting.
    pub fn try_accept(&mut self) -> Option<ServerConn> {
        self.accepted_rx.try_recv().ok()
    }

    /// Fail the next connect with `err`. Queued refusals apply in order.
    pub fn refuse_next(&self, err: TransportError) {
        self.inner.refusals.lock().push_back(err);
    }

    /// Fail every connect with `err` until cleared with `None`.
    pub fn refuse_all(&self, err: Option<TransportError>) {
        *self.inner.refuse_all.lock() = err;
    }

    /// Connect attempts seen so far, accepted or not.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.lock().len()
    }

    /// Token carried by the most recent connect attempt.
    pub fn last_token(&self) -> Option<String> {
        let attempts = self.inner.attempts.lock();
        let url = attempts.last()?;
        url.query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    }
}

/// Server view of one accepted connection. Dropping it closes the socket.
pub struct ServerConn {
    pub token: Option<String>,
    to_client: Option<ToClient>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    pub fn send_text(&self, text: impl Into<String>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(text.into()));
        }
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    /// Deliver a transport error, then close.
    pub fn fail(&mut self, err: TransportError) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Clean close from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }

    /// Next frame sent by the client; `None` once it has closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Next client frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

struct MemoryTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.to_server
            .send(text)
            .map_err(|_| TransportError::Socket("peer closed".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_server.recv().await
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut server) = memory_transport();
        let url = Url::parse("ws://test/ws/?token=abc").unwrap();
        let mut transport = connector.connect(&url).await.unwrap();
        let mut conn = server.accept().await.unwrap();
        assert_eq!(conn.token.as_deref(), Some("abc"));

        transport.send("up".into()).await.unwrap();
        assert_eq!(conn.recv().await.as_deref(), Some("up"));

        conn.send_text("down");
        assert_eq!(transport.recv().await.unwrap().unwrap(), "down");

        conn.close();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn scripted_refusals_apply_in_order() {
        let (connector, mut server) = memory_transport();
        let url = Url::parse("ws://test/ws/?token=abc").unwrap();
        server.refuse_next(TransportError::Socket("down".into()));

        assert!(connector.connect(&url).await.is_err());
        assert!(connector.connect(&url).await.is_ok());
        assert_eq!(server.attempts(), 2);
        assert!(server.try_accept().is_some());
    }
}
