//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::socketio::DEFAULT_NAMESPACE;
use crate::core::{ExponentialBackoff, SyncError, SyncResult};

pub const ENV_PREFIX: &str = "FLEET_SYNC_";

/// Options for [`crate::SyncClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backend base URL, e.g. `http://localhost:8000`.
    #[serde(default = "default_url")]
    pub url: String,

    /// Socket.IO namespace. Default: `/`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Reconnect automatically after an unexpected drop. Default: `true`.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Delay before the first retry; doubles per consecutive failure. Default: 1000 ms.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Cap on the retry delay. Default: 30000 ms.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Consecutive failed attempts before the client gives up. Default: 5.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Randomize retry delays into `[delay / 2, delay]`. Default: `false`.
    #[serde(default)]
    pub reconnect_jitter: bool,

    /// Automatic latency ping interval; `0` disables. Default: 30000 ms.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// How long a latency ping may stay unanswered. Default: 5000 ms.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Budget for one connection attempt, handshake included. Default: 10000 ms.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Event history capacity; `0` keeps nothing. Default: 100.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_ping_interval_ms() -> u64 {
    30000
}

fn default_ping_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10000
}

fn default_history_capacity() -> usize {
    100
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: default_namespace(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_jitter: false,
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl SyncConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `FLEET_SYNC_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SyncConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(url) = var("URL") {
            config.url = url;
        }
        if let Some(namespace) = var("NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(raw) = var("AUTO_RECONNECT") {
            config.auto_reconnect = parse_bool("AUTO_RECONNECT", &raw)?;
        }
        if let Some(raw) = var("RECONNECT_DELAY_MS") {
            config.reconnect_delay_ms = parse_var("RECONNECT_DELAY_MS", &raw)?;
        }
        if let Some(raw) = var("MAX_RECONNECT_DELAY_MS") {
            config.max_reconnect_delay_ms = parse_var("MAX_RECONNECT_DELAY_MS", &raw)?;
        }
        if let Some(raw) = var("MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = parse_var("MAX_RECONNECT_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = var("RECONNECT_JITTER") {
            config.reconnect_jitter = parse_bool("RECONNECT_JITTER", &raw)?;
        }
        if let Some(raw) = var("PING_INTERVAL_MS") {
            config.ping_interval_ms = parse_var("PING_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = var("PING_TIMEOUT_MS") {
            config.ping_timeout_ms = parse_var("PING_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = parse_var("CONNECT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("HISTORY_CAPACITY") {
            config.history_capacity = parse_var("HISTORY_CAPACITY", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_jitter(mut self, jitter: bool) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Pass `0` to disable automatic latency pings.
    pub fn with_ping_interval_ms(mut self, interval_ms: u64) -> Self {
        self.ping_interval_ms = interval_ms;
        self
    }

    pub fn with_ping_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ping_timeout_ms = timeout_ms;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.url.trim().is_empty() {
            return Err(SyncError::Config("url must not be empty".to_string()));
        }
        crate::codec::websocket_url(&self.url)?;
        if self.max_reconnect_attempts == 0 {
            return Err(SyncError::Config(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(SyncError::Config(
                "reconnect_delay_ms must be positive".to_string(),
            ));
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(SyncError::Config(format!(
                "max_reconnect_delay_ms ({}) is below reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.reconnect_delay_ms
            )));
        }
        if self.ping_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(SyncError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect schedule described by this configuration.
    pub fn backoff(&self) -> ExponentialBackoff {
        let backoff = ExponentialBackoff::new(
            self.reconnect_delay(),
            self.max_reconnect_delay(),
            self.max_reconnect_attempts,
        )
        .with_jitter(self.reconnect_jitter);
        if self.auto_reconnect {
            backoff
        } else {
            backoff.abort()
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> SyncResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("{ENV_PREFIX}{name}={raw:?}: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> SyncResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::Config(format!(
            "{ENV_PREFIX}{name}={raw:?}: expected a boolean"
        ))),
    }
}
