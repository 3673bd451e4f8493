//! Global Connection Broadcaster.
//!
//! Owns the one [`Client`] of the current session and republishes everything
//! it emits on the [`Bus`]. Any number of UI subtrees (or host components)
//! call [`Broadcaster::mount`]; they all share the same connection, and the
//! session ends when the last [`MountGuard`] is dropped or
//! [`Broadcaster::end_session`] is called.
//!
//! A supervisor task does the work: it polls the session store until an
//! access token appears, builds the Client, answers control requests from
//! the bus and hands auth errors to the [`AuthErrorPolicy`]. A
//! `token_expiring` warning is answered with an early refresh that is handed
//! to the Client in-band, so the socket stays open.
//!
//! Resuming after `token_expired` is paced like any other reconnect: a
//! refreshed token that is rejected again within one heartbeat interval
//! counts as a retry, retries back off per [`ReconnectConfig`], and past
//! `max_attempts` the session is ended.
//!
//! [`ReconnectConfig`]: crate::config::ReconnectConfig

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::{Bus, BusEvent, ControlRequest};
use crate::client::{Client, is_usable_token};
use crate::config::{RealtimeConfig, TokenWaitConfig};
use crate::event::{ClientEvent, EventKind};
use crate::policy::AuthErrorPolicy;
use crate::protocol::InboundMessage;
use crate::session::SessionStore;
use crate::state::{AuthError, AuthErrorKind, ConnectionState, ErrorCategory};
use crate::transport::Connector;
use crate::transport::ws::WsConnector;

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    bus: Arc<Bus>,
    config: RealtimeConfig,
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn Connector>,
    policy: Arc<AuthErrorPolicy>,
    client: Mutex<Option<Arc<Client>>>,
    /// Bumped per Client so errors from a replaced one are ignored.
    client_seq: AtomicU64,
    mounts: Mutex<usize>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// What a Client's listeners pass to the supervisor, tagged with the
/// Client's sequence number.
#[derive(Debug)]
enum Signal {
    AuthError(AuthError),
    TokenExpiring,
}

type SignalTx = mpsc::UnboundedSender<(u64, Signal)>;

/// Keeps the session alive while held.
pub struct MountGuard {
    inner: Arc<Inner>,
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let last = {
            let mut mounts = self.inner.mounts.lock();
            *mounts = mounts.saturating_sub(1);
            *mounts == 0
        };
        if last {
            tracing::debug!("last mount dropped");
            self.inner.stop();
        }
    }
}

impl Broadcaster {
    /// Broadcaster using the WebSocket transport.
    pub fn new(bus: Arc<Bus>, config: RealtimeConfig, store: Arc<dyn SessionStore>) -> Self {
        Self::with_connector(bus, config, store, Arc::new(WsConnector))
    }

    pub fn with_connector(
        bus: Arc<Bus>,
        config: RealtimeConfig,
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let policy = Arc::new(AuthErrorPolicy::new(store.clone()));
        Self {
            inner: Arc::new(Inner {
                bus,
                config,
                store,
                connector,
                policy,
                client: Mutex::new(None),
                client_seq: AtomicU64::new(0),
                mounts: Mutex::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Join the session, starting it if nothing is running.
    ///
    /// Must be called inside a tokio runtime; outside one the guard is
    /// returned but no session starts.
    pub fn mount(&self) -> MountGuard {
        *self.inner.mounts.lock() += 1;
        self.inner.start();
        MountGuard {
            inner: self.inner.clone(),
        }
    }

    /// Log out: stop the supervisor and destroy the Client.
    pub fn end_session(&self) {
        self.inner.stop();
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.inner.bus
    }

    pub fn policy(&self) -> &Arc<AuthErrorPolicy> {
        &self.inner.policy
    }

    /// Snapshot of the shared connection; the baseline when there is none.
    pub fn state(&self) -> ConnectionState {
        self.inner
            .client
            .lock()
            .as_ref()
            .map(|c| c.get_state())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .supervisor
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Inner {
    fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("broadcaster mounted outside a tokio runtime");
            return;
        };
        // Subscribe before spawning so no request sent after mount is missed.
        let control = self.bus.subscribe_control();
        tracing::info!("starting realtime session");
        *supervisor = Some(runtime.spawn(supervise(self.clone(), control)));
    }

    fn stop(&self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.teardown();
    }

    /// Destroy the current Client, if any. Its final events still reach the bus.
    fn teardown(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            self.client_seq.fetch_add(1, Ordering::SeqCst);
            client.destroy();
        }
    }

    /// Build a Client for `token`, wire it to the bus and connect.
    fn open(&self, token: &str, signal_tx: &SignalTx) -> bool {
        let client = match Client::with_connector(self.config.clone(), self.connector.clone()) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!(error = %e, "can't build realtime client");
                return false;
            }
        };
        let seq = self.client_seq.fetch_add(1, Ordering::SeqCst) + 1;

        for kind in EventKind::ALL {
            let bus = self.bus.clone();
            let signal_tx = signal_tx.clone();
            client.add_event_listener(kind, move |event| {
                match event {
                    ClientEvent::AuthError(err) => {
                        let _ = signal_tx.send((seq, Signal::AuthError(err.clone())));
                    }
                    ClientEvent::Message(InboundMessage::TokenExpiring { .. }) => {
                        let _ = signal_tx.send((seq, Signal::TokenExpiring));
                    }
                    _ => {}
                }
                bus.publish(republish(event));
            });
        }

        client.connect(token);
        *self.client.lock() = Some(client);
        true
    }

    fn publish_state(&self) {
        let state = self
            .client
            .lock()
            .as_ref()
            .map(|c| c.get_state())
            .unwrap_or_default();
        self.bus.publish(BusEvent::ConnectionState(state));
    }

    fn current_client(&self) -> Option<Arc<Client>> {
        self.client.lock().clone()
    }

    fn is_current(&self, seq: u64) -> bool {
        self.client_seq.load(Ordering::SeqCst) == seq
    }
}

fn republish(event: &ClientEvent) -> BusEvent {
    match event {
        ClientEvent::Connected => BusEvent::Connected,
        ClientEvent::Disconnected { reason } => BusEvent::Disconnected {
            reason: reason.clone(),
        },
        ClientEvent::StateChange(state) => BusEvent::ConnectionState(state.clone()),
        ClientEvent::AuthError(err) => BusEvent::AuthError(err.clone()),
        ClientEvent::Message(message) => BusEvent::ConnectionMessage(message.clone()),
    }
}

/// Bounded poll for the session store to report a usable token.
struct TokenWait {
    next_at: Instant,
    delay: Duration,
    polls: u32,
}

impl TokenWait {
    fn new(config: &TokenWaitConfig) -> Self {
        Self {
            next_at: Instant::now(),
            delay: config.initial_delay,
            polls: 0,
        }
    }
}

/// Pacing for resuming after `token_expired`.
#[derive(Default)]
struct AuthRetry {
    /// Consecutive resumes the server rejected straight away.
    attempts: u32,
    last_resume: Option<Instant>,
    resume_at: Option<Instant>,
}

impl AuthRetry {
    /// Count a rejection. A rejection within `window` of the last resume
    /// means the refreshed token did not help.
    fn rejected(&mut self, window: Duration) -> u32 {
        let quick = self.last_resume.is_some_and(|at| at.elapsed() < window);
        self.attempts = if quick { self.attempts + 1 } else { 0 };
        self.attempts
    }

    fn schedule(&mut self, delay: Duration) {
        self.resume_at = Some(Instant::now() + delay);
    }

    fn resumed(&mut self) {
        self.resume_at = None;
        self.last_resume = Some(Instant::now());
    }
}

async fn supervise(inner: Arc<Inner>, mut control: broadcast::Receiver<ControlRequest>) {
    let wait_config = inner.config.token_wait.clone();
    let reconnect = inner.config.reconnect.clone();
    let stable_after = inner.config.heartbeat.interval;
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<(u64, Signal)>();
    let mut waiting = Some(TokenWait::new(&wait_config));
    let mut retry = AuthRetry::default();

    loop {
        let poll_at = waiting.as_ref().map_or_else(Instant::now, |w| w.next_at);
        let resume_at = retry.resume_at.unwrap_or_else(Instant::now);
        tokio::select! {
            biased;
            request = control.recv() => match request {
                Ok(ControlRequest::RequestReconnect) => {
                    tracing::info!("reconnect requested");
                    inner.teardown();
                    retry = AuthRetry::default();
                    waiting = Some(TokenWait::new(&wait_config));
                }
                Ok(ControlRequest::RequestDisconnect) => {
                    tracing::info!("disconnect requested");
                    inner.teardown();
                    retry = AuthRetry::default();
                    waiting = None;
                    inner.publish_state();
                }
                Ok(ControlRequest::RequestState) => inner.publish_state(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "control requests dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            Some((seq, signal)) = signal_rx.recv() => {
                if !inner.is_current(seq) {
                    tracing::debug!(?signal, "ignoring signal from a replaced client");
                    continue;
                }
                match signal {
                    Signal::TokenExpiring => {
                        let Some(token) = inner.policy.refresh_before_expiry().await else {
                            continue;
                        };
                        match inner.current_client() {
                            Some(client) if inner.is_current(seq) => client.set_token(&token),
                            _ => tracing::debug!("client replaced during early refresh"),
                        }
                    }
                    Signal::AuthError(error) => {
                        if error.kind == AuthErrorKind::TokenExpired {
                            let attempt = retry.rejected(stable_after);
                            if attempt > reconnect.max_attempts {
                                give_up(&inner, attempt).await;
                                retry = AuthRetry::default();
                                waiting = None;
                                continue;
                            }
                        }
                        let recovered = inner.policy.handle_auth_error(&error).await;
                        if recovered {
                            let delay = match retry.attempts {
                                0 => Duration::ZERO,
                                n => reconnect.delay_for(n),
                            };
                            tracing::info!(attempt = retry.attempts, delay_ms = delay.as_millis() as u64, "resuming with refreshed token");
                            retry.schedule(delay);
                        } else if error.category() == ErrorCategory::Authentication {
                            tracing::warn!(kind = %error.kind, "session is over, closing connection");
                            inner.teardown();
                            retry = AuthRetry::default();
                            waiting = None;
                        }
                    }
                }
            },
            _ = tokio::time::sleep_until(resume_at), if retry.resume_at.is_some() => {
                retry.resumed();
                match (inner.store.access_token(), inner.current_client()) {
                    (Some(token), Some(client)) => client.connect(&token),
                    _ => tracing::warn!("recovered but no token or client to resume with"),
                }
            },
            _ = tokio::time::sleep_until(poll_at), if waiting.is_some() => {
                let token = inner.store.access_token().filter(|t| is_usable_token(t));
                if let Some(token) = token {
                    waiting = None;
                    inner.open(&token, &signal_tx);
                    continue;
                }
                if let Some(wait) = waiting.as_mut() {
                    wait.polls += 1;
                    if wait.polls >= wait_config.max_polls {
                        tracing::warn!(polls = wait.polls, "no access token yet, waiting for a reconnect request");
                        waiting = None;
                    } else {
                        wait.next_at = Instant::now() + wait.delay;
                        wait.delay = (wait.delay * 2).min(wait_config.max_delay);
                    }
                }
            },
        }
    }
}

/// The server keeps rejecting freshly refreshed tokens. The Policy ends the
/// session, the Client is destroyed, then the failure is published.
async fn give_up(inner: &Inner, attempts: u32) {
    tracing::error!(attempts, "server keeps rejecting refreshed tokens, giving up");
    let error = AuthError::token_refresh_failed("Server keeps rejecting refreshed tokens");
    inner.policy.handle_auth_error(&error).await;
    inner.teardown();
    inner.bus.publish(BusEvent::AuthError(error));
}
