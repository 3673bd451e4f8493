//! agora-watch: keep one live Agora real-time session and log what it sees.
//!
//! Mounts the Broadcaster with an HTTP-backed session store, feeds the bus
//! into the unread-count and notification consumers, and logs connection
//! changes until interrupted.
//!
//! Set AGORA_LOG_JSON=1 for JSON logs.

use std::path::PathBuf;
use std::sync::Arc;

use agora_realtime::bus::Envelope;
use agora_realtime::consumers::Effect;
use agora_realtime::consumers::notifications::NotificationFeed;
use agora_realtime::consumers::unread::UnreadCounts;
use agora_realtime::protocol::UserId;
use agora_realtime::{
    Broadcaster, Bus, BusEvent, HttpSessionStore, RealtimeConfig, TokenPair,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agora-watch", about = "Watch an Agora real-time session")]
struct Args {
    /// Config file (default: ~/.config/agora/realtime.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// REST base URL; the socket URL is derived from it
    #[arg(long, env = "AGORA_API_BASE")]
    api_base: Option<String>,

    /// Access token
    #[arg(long, env = "AGORA_TOKEN")]
    token: Option<String>,

    /// Refresh token, used when the access token expires
    #[arg(long, env = "AGORA_REFRESH_TOKEN")]
    refresh_token: Option<String>,

    /// Signed-in user's id, to tell own messages from others'
    #[arg(long, env = "AGORA_USER_ID")]
    user_id: UserId,

    /// Print every bus envelope to stdout as a JSON line
    #[arg(long)]
    print_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("AGORA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "agora_realtime=info,agora_watch=info".into());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RealtimeConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RealtimeConfig::load(),
    };
    if let Some(api_base) = args.api_base {
        config.api_base_url = api_base;
    }
    let endpoint = config.socket_endpoint().context("invalid api base url")?;
    tracing::info!(%endpoint, "watching realtime channel");

    let tokens = args.token.map(|access| TokenPair {
        access,
        refresh: args.refresh_token,
    });
    if tokens.is_none() {
        tracing::warn!("no access token yet; waiting for one");
    }
    let store = Arc::new(HttpSessionStore::new(&config.api_base_url, tokens));

    let bus = Arc::new(Bus::new());
    let mut events = bus.subscribe();
    let mut unread = UnreadCounts::new(args.user_id);
    let mut feed = NotificationFeed::new(config.notification_history);

    let broadcaster = Broadcaster::new(bus.clone(), config, store);
    let _mount = broadcaster.mount();

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) => {
                    if args.print_events {
                        println!("{}", serde_json::to_string(&envelope)?);
                    }
                    log_event(&broadcaster, &envelope);
                    let effects = [unread.apply(&envelope.event), feed.apply(&envelope.event)];
                    report(&unread, &feed, effects);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "fell behind the bus");
                    let effects = [unread.on_lagged(), feed.on_lagged()];
                    report(&unread, &feed, effects);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, closing session");
                break;
            }
        }
    }

    broadcaster.end_session();
    Ok(())
}

fn log_event(broadcaster: &Broadcaster, envelope: &Envelope) {
    match &envelope.event {
        BusEvent::Connected => {
            tracing::info!(seq = envelope.seq, "connected");
            // A new episode; show errors again.
            broadcaster.policy().clear_dismissed_errors();
        }
        BusEvent::Disconnected { reason } => {
            tracing::info!(seq = envelope.seq, %reason, "disconnected");
        }
        BusEvent::AuthError(err) => {
            let policy = broadcaster.policy();
            if policy.should_display(err) {
                tracing::warn!(kind = %err.kind, can_retry = err.can_retry, "{}", err.message);
                policy.dismiss_error(&err.id());
            } else {
                tracing::debug!(kind = %err.kind, "repeat auth error suppressed");
            }
        }
        BusEvent::ConnectionState(state) => {
            if state.token_expiring {
                tracing::warn!(expires_in = ?state.token_expires_in, "access token expiring");
            }
            if state.is_reconnecting {
                tracing::info!(attempt = state.reconnect_attempts, "reconnecting");
            }
        }
        BusEvent::ConnectionMessage(message) => {
            tracing::debug!(seq = envelope.seq, kind = message.kind(), "message");
        }
    }
}

fn report(unread: &UnreadCounts, feed: &NotificationFeed, effects: [Effect; 2]) {
    let [unread_effect, feed_effect] = effects;
    match unread_effect {
        Effect::Updated => tracing::info!(total = unread.total(), "unread messages"),
        Effect::Refetch => tracing::info!("unread counts need a REST reload"),
        Effect::Unchanged => {}
    }
    match feed_effect {
        Effect::Updated => {
            if let Some(item) = feed.items().next() {
                tracing::info!(
                    kind = ?item.kind,
                    thread = %item.notification.thread_title,
                    unread = feed.unread_count(),
                    "{}",
                    item.notification.message
                );
            }
        }
        Effect::Refetch => tracing::info!("notifications need a REST reload"),
        Effect::Unchanged => {}
    }
}
