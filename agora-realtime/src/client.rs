//! Authenticated WebSocket client.
//!
//! This is the main entry point for consumers. A [`Client`] keeps exactly one
//! live connection to the per-user channel, probes it with heartbeats,
//! reconnects with capped exponential backoff and emits [`ClientEvent`]s to
//! registered listeners.
//!
//! ## Tasks and ownership
//!
//! Each `connect` spawns one session task that owns the socket and is driven
//! by `select!` over the socket, a command channel, the heartbeat ticker and
//! the ack deadline. The task is the only writer of [`ConnectionState`]
//! while it is current. `disconnect` bumps a generation counter under the
//! dispatch lock, so a task that is still winding down can no longer mutate
//! state or emit events.
//!
//! ## Failure handling
//!
//! Public operations never fail. Transport failures are retried up to
//! [`ReconnectConfig::max_attempts`](crate::config::ReconnectConfig) and then
//! reported once as `connection_lost`. A credential rejection is reported
//! once as `token_expired` and is not retried; recovering from it is the
//! Auth-Error Policy's call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use crate::config::RealtimeConfig;
use crate::error::ConfigError;
use crate::event::{ClientEvent, EventKind};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::state::{AuthError, ConnectionState};
use crate::transport::ws::WsConnector;
use crate::transport::{Connector, Transport};

/// Tokens that front-ends store when there is no session.
const PLACEHOLDER_TOKENS: [&str; 3] = ["null", "undefined", "none"];

/// Handle returned by [`Client::add_event_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Whether `token` can be presented to the server at all.
pub fn is_usable_token(token: &str) -> bool {
    let trimmed = token.trim();
    !trimmed.is_empty()
        && !PLACEHOLDER_TOKENS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Commands from the public API to the session task.
#[derive(Debug)]
enum Command {
    /// Present a new token over the open socket.
    RefreshInBand(String),
    Shutdown,
}

struct Session {
    token: Arc<Mutex<String>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Session {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

/// State and listener registry shared with the session task.
struct Shared {
    /// Serializes every state mutation with the events it produces.
    /// Re-entrant so a listener may call back into the Client.
    dispatch: ReentrantMutex<()>,
    generation: AtomicU64,
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
    next_listener: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            dispatch: ReentrantMutex::new(()),
            generation: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Mutate the state and emit the returned events followed by a
    /// `StateChange`. Returns false if `generation` has been superseded.
    fn transition<F>(&self, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut ConnectionState) -> Vec<ClientEvent>,
    {
        let _dispatch = self.dispatch.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        let (events, snapshot) = {
            let mut state = self.state.lock();
            let events = f(&mut state);
            (events, state.clone())
        };
        for event in &events {
            self.emit(event);
        }
        self.emit(&ClientEvent::StateChange(snapshot));
        true
    }

    /// Emit an event that does not touch the state.
    fn emit_current(&self, generation: u64, event: ClientEvent) -> bool {
        let _dispatch = self.dispatch.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.emit(&event);
        true
    }

    /// Start a new generation; the caller spawns a session task for it.
    fn begin(&self) -> u64 {
        let _dispatch = self.dispatch.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock();
        state.mark_disconnected();
        state.auth_error = None;
        generation
    }

    /// Invalidate the current generation and return to the baseline.
    fn reset(&self, reason: &str) {
        let _dispatch = self.dispatch.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_active = {
            let mut state = self.state.lock();
            let was_active = state.is_connected || state.is_reconnecting;
            *state = ConnectionState::default();
            was_active
        };
        if was_active {
            self.emit(&ClientEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        self.emit(&ClientEvent::StateChange(ConnectionState::default()));
    }

    fn emit(&self, event: &ClientEvent) {
        let kind = event.kind();
        // Call outside the registry lock so handlers may (un)register.
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| l.clone())
            .collect();
        for listener in targets {
            listener(event);
        }
    }
}

/// Authenticated, auto-recovering connection to the per-user channel.
pub struct Client {
    config: Arc<RealtimeConfig>,
    endpoint: Url,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    destroyed: AtomicBool,
}

impl Client {
    /// Client using the WebSocket transport.
    pub fn new(config: RealtimeConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoint = config.socket_endpoint()?;
        Ok(Self {
            config: Arc::new(config),
            endpoint,
            connector,
            shared: Arc::new(Shared::new()),
            session: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Open the connection with `token`.
    ///
    /// A no-op when a live session already uses the same token; otherwise
    /// any existing session is torn down first. Unusable tokens, a destroyed
    /// client or a missing tokio runtime are logged and ignored.
    pub fn connect(&self, token: &str) {
        if self.destroyed.load(Ordering::SeqCst) {
            tracing::warn!("connect called on a destroyed client");
            return;
        }
        if !is_usable_token(token) {
            tracing::warn!("refusing to connect without a usable access token");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("connect called outside a tokio runtime");
            return;
        };

        let old = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.is_live() && *s.token.lock() == token) {
                tracing::debug!("already connected with this token");
                return;
            }
            slot.take()
        };
        if let Some(old) = old {
            let _ = old.cmd_tx.send(Command::Shutdown);
            // Emits; the session lock must not be held here.
            self.shared.reset("replaced by a new connection");
        }

        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| s.is_live() && *s.token.lock() == token) {
            return;
        }
        if let Some(raced) = slot.take() {
            let _ = raced.cmd_tx.send(Command::Shutdown);
        }
        let generation = self.shared.begin();
        let token = Arc::new(Mutex::new(token.to_string()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctx = SessionCtx {
            generation,
            config: self.config.clone(),
            endpoint: self.endpoint.clone(),
            connector: self.connector.clone(),
            token: token.clone(),
        };
        let task = runtime.spawn(run_session(self.shared.clone(), ctx, cmd_rx));
        *slot = Some(Session {
            token,
            cmd_tx,
            task,
        });
    }

    /// Swap the access token without a full reconnect.
    ///
    /// With a live session the token is sent in-band as `refresh_token` and
    /// used for any later reconnect; otherwise this is `connect(token)`.
    pub fn set_token(&self, token: &str) {
        if !is_usable_token(token) {
            tracing::warn!("ignoring unusable replacement token");
            return;
        }
        {
            let slot = self.session.lock();
            if let Some(session) = slot.as_ref().filter(|s| s.is_live()) {
                *session.token.lock() = token.to_string();
                let _ = session
                    .cmd_tx
                    .send(Command::RefreshInBand(token.to_string()));
                return;
            }
        }
        self.connect(token);
    }

    /// Close the socket, cancel every timer and reset the state.
    pub fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let _ = session.cmd_tx.send(Command::Shutdown);
        }
        self.shared.reset("client disconnected");
    }

    /// `disconnect`, then drop every listener. The client cannot be reused.
    pub fn destroy(&self) {
        self.disconnect();
        self.destroyed.store(true, Ordering::SeqCst);
        self.shared.listeners.lock().clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn get_state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }

    pub fn add_event_listener<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        if self.is_destroyed() {
            return id;
        }
        self.shared
            .listeners
            .lock()
            .push((id, kind, Arc::new(handler)));
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.cmd_tx.send(Command::Shutdown);
        }
    }
}

struct SessionCtx {
    generation: u64,
    config: Arc<RealtimeConfig>,
    endpoint: Url,
    connector: Arc<dyn Connector>,
    token: Arc<Mutex<String>>,
}

impl SessionCtx {
    fn url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("token", &self.token.lock());
        url
    }
}

/// Why a connection attempt or an open connection ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    /// The server refused the credential.
    Rejected(String),
    HeartbeatTimeout(u32),
    Lost(String),
    ConnectFailed(String),
}

async fn run_session(
    shared: Arc<Shared>,
    ctx: SessionCtx,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let generation = ctx.generation;
    let reconnect = &ctx.config.reconnect;
    let mut attempt: u32 = 0;

    loop {
        let url = ctx.url();
        let connecting = tokio::time::timeout(ctx.config.connect_timeout, ctx.connector.connect(&url));
        let result = tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Shutdown) => return,
                // Not connected yet; the shared token is already updated.
                Some(Command::RefreshInBand(_)) => continue,
            },
            result = connecting => result.unwrap_or_else(|_| {
                Err(crate::error::TransportError::Timeout(ctx.config.connect_timeout))
            }),
        };

        let end = match result {
            Ok(transport) => {
                attempt = 0;
                let opened = shared.transition(generation, |state| {
                    state.mark_connected();
                    vec![ClientEvent::Connected]
                });
                if !opened {
                    return;
                }
                tracing::info!("realtime connection established");
                drive(&shared, &ctx, transport, &mut cmd_rx).await
            }
            Err(e) if e.is_auth() => SessionEnd::Rejected(e.to_string()),
            Err(e) => SessionEnd::ConnectFailed(e.to_string()),
        };

        let mut pending = Vec::new();
        let mut error = None;
        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Rejected(reason) => {
                tracing::warn!(%reason, "server rejected the access token");
                let err = AuthError::token_expired(reason.clone());
                shared.transition(generation, |state| {
                    let mut events = Vec::new();
                    if state.is_connected {
                        events.push(ClientEvent::Disconnected { reason });
                    }
                    state.mark_disconnected();
                    state.auth_error = Some(err.clone());
                    events.push(ClientEvent::AuthError(err));
                    events
                });
                return;
            }
            SessionEnd::HeartbeatTimeout(missed) => {
                tracing::warn!(missed, "heartbeat timeout, reconnecting");
                let err = AuthError::heartbeat_timeout(missed);
                pending.push(ClientEvent::AuthError(err.clone()));
                error = Some(err);
                pending.push(ClientEvent::Disconnected {
                    reason: "heartbeat timeout".into(),
                });
            }
            SessionEnd::Lost(reason) => {
                tracing::warn!(%reason, "realtime connection lost");
                pending.push(ClientEvent::Disconnected { reason });
            }
            SessionEnd::ConnectFailed(reason) => {
                tracing::warn!(%reason, attempt, "connect failed");
            }
        }

        attempt += 1;
        if attempt > reconnect.max_attempts {
            let err = AuthError::connection_lost(reconnect.max_attempts);
            tracing::error!(attempts = reconnect.max_attempts, "giving up on reconnecting");
            shared.transition(generation, |state| {
                state.mark_disconnected();
                state.auth_error = Some(err.clone());
                pending.push(ClientEvent::AuthError(err));
                pending
            });
            return;
        }

        let delay = reconnect.delay_for(attempt);
        let scheduled = shared.transition(generation, |state| {
            if let Some(err) = error {
                state.auth_error = Some(err);
            }
            state.mark_reconnecting(attempt);
            pending
        });
        if !scheduled {
            return;
        }
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let wake_at = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => return,
                    Some(Command::RefreshInBand(_)) => {}
                },
                _ = tokio::time::sleep_until(wake_at) => break,
            }
        }
    }
}

/// Pump one open connection until it ends.
async fn drive(
    shared: &Shared,
    ctx: &SessionCtx,
    mut transport: Box<dyn Transport>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let generation = ctx.generation;
    let heartbeat = &ctx.config.heartbeat;
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ack_deadline: Option<Instant> = None;
    let mut missed: u32 = 0;

    loop {
        let ack_timer = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now));
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Shutdown) => {
                    transport.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(Command::RefreshInBand(token)) => {
                    tracing::debug!("sending in-band token refresh");
                    let frame = OutboundMessage::RefreshToken { token }.to_json();
                    if let Err(e) = transport.send(frame).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            },
            frame = transport.recv() => match frame {
                None => return SessionEnd::Lost("closed by server".into()),
                Some(Err(e)) if e.is_auth() => return SessionEnd::Rejected(e.to_string()),
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                Some(Ok(text)) => {
                    let message = match InboundMessage::parse(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    if message == InboundMessage::HeartbeatAck {
                        missed = 0;
                        ack_deadline = None;
                    }
                    if let Some(reply) = handle_inbound(shared, ctx, message) {
                        if let Err(e) = transport.send(reply.to_json()).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
            },
            _ = ack_timer, if ack_deadline.is_some() => {
                ack_deadline = None;
                missed += 1;
                tracing::warn!(missed, "heartbeat not acknowledged");
                if missed >= heartbeat.max_missed {
                    transport.close().await;
                    return SessionEnd::HeartbeatTimeout(missed);
                }
            },
            _ = ticker.tick() => {
                // One probe in flight at a time.
                if ack_deadline.is_none() {
                    if let Err(e) = transport.send(OutboundMessage::Heartbeat.to_json()).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    ack_deadline = Some(Instant::now() + heartbeat.ack_timeout);
                }
            },
        }

        if shared.generation.load(Ordering::SeqCst) != generation {
            transport.close().await;
            return SessionEnd::Shutdown;
        }
    }
}

/// Apply control messages to the state and forward the rest. Returns a frame
/// to send back, if any.
fn handle_inbound(
    shared: &Shared,
    ctx: &SessionCtx,
    message: InboundMessage,
) -> Option<OutboundMessage> {
    let generation = ctx.generation;
    tracing::debug!(kind = message.kind(), "inbound frame");
    match &message {
        InboundMessage::HeartbeatAck => {
            shared.transition(generation, |state| {
                state.last_heartbeat = Some(Utc::now());
                Vec::new()
            });
            return None;
        }
        InboundMessage::Ping => return Some(OutboundMessage::Pong),
        InboundMessage::Pong => return None,
        InboundMessage::TokenRefreshed {
            success: true,
            token,
            expires_in,
        } => {
            if let Some(token) = token {
                *ctx.token.lock() = token.clone();
            }
            tracing::info!(expires_in = ?expires_in, "access token refreshed in-band");
            shared.transition(generation, |state| {
                state.token_refreshed(*expires_in);
                Vec::new()
            });
        }
        InboundMessage::TokenRefreshed { success: false, .. } => {
            report_refresh_failure(shared, generation, "Token refresh was not accepted");
        }
        InboundMessage::TokenRefreshFailed { message: reason } => {
            report_refresh_failure(
                shared,
                generation,
                reason.as_deref().unwrap_or("Token refresh failed"),
            );
        }
        InboundMessage::TokenExpiring { expires_in } => {
            tracing::info!(expires_in, "access token expiring");
            shared.transition(generation, |state| {
                state.token_expiring = true;
                state.token_expires_in = Some(*expires_in);
                Vec::new()
            });
        }
        InboundMessage::Unknown { .. } => {
            tracing::debug!("forwarding untyped frame");
        }
        _ => {}
    }
    shared.emit_current(generation, ClientEvent::Message(message));
    None
}

fn report_refresh_failure(shared: &Shared, generation: u64, reason: &str) {
    tracing::warn!(%reason, "in-band token refresh failed");
    let err = AuthError::token_refresh_failed(reason);
    shared.transition(generation, |state| {
        state.auth_error = Some(err.clone());
        vec![ClientEvent::AuthError(err)]
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::memory_transport;

    #[test]
    fn placeholder_tokens_are_unusable() {
        assert!(!is_usable_token(""));
        assert!(!is_usable_token("   "));
        assert!(!is_usable_token("null"));
        assert!(!is_usable_token("Undefined"));
        assert!(is_usable_token("eyJhbGciOi"));
    }

    #[test]
    fn listeners_receive_only_their_kind() {
        let (connector, _server) = memory_transport();
        let client = Client::with_connector(RealtimeConfig::default(), Arc::new(connector)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = client.add_event_listener(EventKind::StateChange, move |e| {
            sink.lock().push(e.kind());
        });

        client.disconnect();
        assert_eq!(*seen.lock(), vec![EventKind::StateChange]);

        assert!(client.remove_event_listener(id));
        assert!(!client.remove_event_listener(id));
        client.disconnect();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn connect_outside_runtime_is_ignored() {
        let (connector, server) = memory_transport();
        let client = Client::with_connector(RealtimeConfig::default(), Arc::new(connector)).unwrap();
        client.connect("tok");
        assert_eq!(server.attempts(), 0);
        assert!(!client.get_state().is_connected);
    }

    #[test]
    fn destroyed_client_stays_silent() {
        let (connector, _server) = memory_transport();
        let client = Client::with_connector(RealtimeConfig::default(), Arc::new(connector)).unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        client.add_event_listener(EventKind::StateChange, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.destroy();
        let after_destroy = hits.load(Ordering::SeqCst);
        client.disconnect();
        assert_eq!(hits.load(Ordering::SeqCst), after_destroy);
        assert!(client.is_destroyed());
    }

    #[test]
    fn invalid_base_url_fails_construction() {
        let config = RealtimeConfig {
            api_base_url: "not a url".into(),
            ..Default::default()
        };
        let (connector, _server) = memory_transport();
        assert!(Client::with_connector(config, Arc::new(connector)).is_err());
    }

    #[test]
    fn zero_heartbeat_interval_fails_construction() {
        let mut config = RealtimeConfig::default();
        config.heartbeat.interval = std::time::Duration::ZERO;
        let (connector, server) = memory_transport();
        let built = Client::with_connector(config, Arc::new(connector));
        assert!(matches!(built, Err(ConfigError::Invalid { field: "heartbeat.interval", .. })));
        assert_eq!(server.attempts(), 0);
    }
}
