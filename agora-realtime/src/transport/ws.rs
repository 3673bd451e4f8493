//! WebSocket transport over tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Connector, Transport, is_auth_close_code};
use crate::error::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a close handshake may take before the socket is simply dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        if url.scheme() == "wss" {
            install_crypto_provider();
        }
        // The query carries the token; keep it out of the logs.
        tracing::debug!(
            host = url.host_str().unwrap_or_default(),
            path = url.path(),
            "opening websocket"
        );

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _response)) => Ok(Box::new(WsTransport { socket })),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                if status == 401 || status == 403 {
                    Err(TransportError::Unauthorized(format!(
                        "handshake rejected with HTTP {status}"
                    )))
                } else {
                    Err(TransportError::Socket(format!(
                        "handshake failed with HTTP {status}"
                    )))
                }
            }
            Err(e) => Err(TransportError::Socket(e.to_string())),
        }
    }
}

fn install_crypto_provider() {
    // Already-installed is fine; the first caller wins.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

struct WsTransport {
    socket: Socket,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.socket.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(TransportError::Socket(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::debug!(len = bytes.len(), "dropping non-utf8 binary frame"),
                },
                Message::Close(frame) => return close_outcome(frame),
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if tokio::time::timeout(CLOSE_GRACE, self.socket.close(None))
            .await
            .is_err()
        {
            tracing::debug!("close handshake timed out");
        }
    }
}

fn close_outcome(frame: Option<CloseFrame>) -> Option<Result<String, TransportError>> {
    let frame = frame?;
    let code = u16::from(frame.code);
    if is_auth_close_code(code) {
        return Some(Err(TransportError::Unauthorized(format!(
            "closed with code {code}: {}",
            frame.reason.as_str()
        ))));
    }
    if frame.code == CloseCode::Normal {
        return None;
    }
    Some(Err(TransportError::Closed {
        code,
        reason: frame.reason.as_str().to_owned(),
    }))
}
