//! Tunables for the real-time layer.
//!
//! Config file lives at `~/.config/agora/realtime.toml`. Every field is
//! optional in the file; durations are written in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Default REST base URL; the socket endpoint is derived from it.
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
/// Path of the per-user notification channel, appended to the base URL.
pub const DEFAULT_SOCKET_PATH: &str = "/ws/notifications/";
/// Longest message body accepted by the send path, in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 5000;

/// Top-level configuration shared by the Client, Broadcaster and send path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// REST base URL (`http://` or `https://`).
    pub api_base_url: String,
    /// Socket path appended to the base URL.
    pub socket_path: String,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    /// Upper bound on a single handshake.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    pub token_wait: TokenWaitConfig,
    pub rate_limit: RateLimitConfig,
    /// Maximum outbound message length in characters.
    pub max_message_length: usize,
    /// Number of forum notifications kept by the notification consumer.
    pub notification_history: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(10),
            token_wait: TokenWaitConfig::default(),
            rate_limit: RateLimitConfig::default(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            notification_history: 50,
        }
    }
}

/// Liveness probing over an open socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Period between `heartbeat` frames.
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// How long to wait for `heartbeat_ack` before counting a miss.
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,
    /// Consecutive misses that end the connection.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            max_missed: 2,
        }
    }
}

/// Configuration for automatic reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt of an episode.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
    /// Attempts per episode before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    ///
    /// `min(initial_delay * backoff_factor^(attempt - 1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// How long the Broadcaster waits for the session store to produce a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenWaitConfig {
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub max_polls: u32,
}

impl Default for TokenWaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_polls: 50,
        }
    }
}

/// Client-side send throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub max_messages: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_messages: 30,
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agora")
}

/// Default location of the config file.
pub fn config_path() -> PathBuf {
    config_dir().join("realtime.toml")
}

impl RealtimeConfig {
    /// Load from the default location, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load() -> Self {
        let path = config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "using default realtime config");
                Self::default()
            }
        }
    }

    /// Load from an explicit path. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the timers and backoff can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.heartbeat.interval.is_zero(), "heartbeat.interval", "must be non-zero"),
            (self.heartbeat.ack_timeout.is_zero(), "heartbeat.ack_timeout", "must be non-zero"),
            (self.heartbeat.max_missed == 0, "heartbeat.max_missed", "must be at least 1"),
            (self.reconnect.max_attempts == 0, "reconnect.max_attempts", "must be at least 1"),
            (
                !(self.reconnect.backoff_factor.is_finite() && self.reconnect.backoff_factor >= 1.0),
                "reconnect.backoff_factor",
                "must be a finite number of at least 1",
            ),
            (self.connect_timeout.is_zero(), "connect_timeout", "must be non-zero"),
        ];
        match checks.into_iter().find(|(bad, _, _)| *bad) {
            Some((_, field, reason)) => Err(ConfigError::Invalid { field, reason }),
            None => Ok(()),
        }
    }

    /// WebSocket endpoint for the per-user channel, without credentials.
    ///
    /// `http` maps to `ws`, `https` to `wss`; any path on the base URL is
    /// kept as a prefix of [`socket_path`](Self::socket_path).
    pub fn socket_endpoint(&self) -> Result<Url, ConfigError> {
        let base = Url::parse(&self.api_base_url).map_err(|source| ConfigError::InvalidBaseUrl {
            url: self.api_base_url.clone(),
            source,
        })?;
        let scheme = match base.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let mut endpoint = base.clone();
        // http(s) -> ws(s) is always a permitted scheme change for special schemes.
        let _ = endpoint.set_scheme(scheme);
        let prefix = base.path().trim_end_matches('/');
        let suffix = self.socket_path.trim_start_matches('/');
        endpoint.set_path(&format!("{prefix}/{suffix}"));
        endpoint.set_query(None);
        endpoint.set_fragment(None);
        Ok(endpoint)
    }

    /// WebSocket URL for a handshake with `token`.
    pub fn socket_url(&self, token: &str) -> Result<Url, ConfigError> {
        let mut url = self.socket_endpoint()?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_maps_to_ws() {
        let config = RealtimeConfig {
            api_base_url: "http://localhost:8000".into(),
            ..Default::default()
        };
        assert_eq!(
            config.socket_endpoint().unwrap().as_str(),
            "ws://localhost:8000/ws/notifications/"
        );
    }

    #[test]
    fn https_maps_to_wss_and_keeps_prefix() {
        let config = RealtimeConfig {
            api_base_url: "https://agora.example.org/api/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.socket_endpoint().unwrap().as_str(),
            "wss://agora.example.org/api/ws/notifications/"
        );
    }

    #[test]
    fn token_goes_in_query() {
        let config = RealtimeConfig::default();
        let url = config.socket_url("abc def").unwrap();
        assert_eq!(url.query(), Some("token=abc+def"));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let config = RealtimeConfig {
            api_base_url: "ftp://example.org".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.socket_endpoint(),
            Err(ConfigError::UnsupportedScheme(s)) if s == "ftp"
        ));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            backoff_factor: 2.0,
            max_attempts: 10,
        };
        assert_eq!(reconnect.delay_for(1), Duration::from_millis(1000));
        assert_eq!(reconnect.delay_for(2), Duration::from_millis(2000));
        assert_eq!(reconnect.delay_for(3), Duration::from_millis(4000));
        assert_eq!(reconnect.delay_for(4), Duration::from_millis(5000));
        assert_eq!(reconnect.delay_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn zero_timers_are_rejected() {
        assert!(RealtimeConfig::default().validate().is_ok());

        let mut config = RealtimeConfig::default();
        config.heartbeat.interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "heartbeat.interval", .. })
        ));

        let mut config = RealtimeConfig::default();
        config.heartbeat.max_missed = 0;
        assert!(config.validate().is_err());

        let mut config = RealtimeConfig::default();
        config.reconnect.backoff_factor = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_rejects_zero_interval() {
        let path = std::env::temp_dir().join(format!("agora-realtime-{}.toml", std::process::id()));
        std::fs::write(&path, "[heartbeat]\ninterval = 0\n").unwrap();
        let loaded = RealtimeConfig::load_from(&path);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(loaded, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: RealtimeConfig = toml::from_str(
            r#"
            api_base_url = "https://agora.example.org"

            [heartbeat]
            interval = 5000

            [reconnect]
            max_attempts = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat.max_missed, 2);
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_message_length, DEFAULT_MAX_MESSAGE_LENGTH);
    }
}
