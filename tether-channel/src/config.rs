//! Channel configuration
//!
//! Tunables for one session channel, with optional overrides from the
//! shared config file (`~/.config/tether/config.toml`). Missing or broken
//! files fall back to defaults with a warning; they never fail a connect.

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

/// Keep-alive probing for one connection.
///
/// A ping goes out every `interval`; absence of any inbound traffic for
/// `idle_timeout` counts as a dead link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Configuration for one [`SessionChannel`](crate::SessionChannel)
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Endpoint URL (`tcp://host:port` or `unix://path`)
    pub endpoint: String,
    /// Keep-alive probing
    pub keepalive: KeepaliveConfig,
    /// Window for a sent message to receive any confirmation before it is
    /// marked failed. Assistant responses can take a while, hence minutes.
    pub delivery_timeout: Duration,
    /// Queue sends issued while disconnected for replay on reconnect.
    /// When off, such sends fail immediately instead.
    pub buffer_while_disconnected: bool,
    /// Backoff applied between reconnect attempts
    pub reconnect: ReconnectPolicy,
}

impl ChannelConfig {
    /// Defaults for the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            keepalive: KeepaliveConfig::default(),
            delivery_timeout: Duration::from_secs(120),
            buffer_while_disconnected: true,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Defaults for the given endpoint, with overrides from the config file
    pub fn load(endpoint: impl Into<String>) -> Self {
        let base = Self::new(endpoint);
        let path = tether_utils::config_file();

        if !path.exists() {
            tracing::debug!("Config file not found, using channel defaults");
            return base;
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => base.apply_file(&content),
            Err(e) => {
                tracing::warn!("Failed to read config file: {}, using defaults", e);
                base
            }
        }
    }

    /// Overlay settings parsed from TOML onto this config
    fn apply_file(self, content: &str) -> Self {
        match toml::from_str::<FileConfig>(content) {
            Ok(file) => Self {
                endpoint: self.endpoint,
                keepalive: KeepaliveConfig {
                    interval: Duration::from_secs(file.keepalive_interval_secs),
                    idle_timeout: Duration::from_secs(file.idle_timeout_secs),
                },
                delivery_timeout: Duration::from_secs(file.delivery_timeout_secs),
                buffer_while_disconnected: file.buffer_while_disconnected,
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_secs(file.reconnect.base_delay_secs),
                    max_delay: Duration::from_secs(file.reconnect.max_delay_secs),
                    max_attempts: file.reconnect.max_attempts,
                },
            },
            Err(e) => {
                tracing::warn!("Failed to parse config file: {}, using defaults", e);
                self
            }
        }
    }

    /// Replace the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Replace the keep-alive settings
    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Replace the delivery confirmation window
    pub fn delivery_timeout(mut self, window: Duration) -> Self {
        self.delivery_timeout = window;
        self
    }

    /// Toggle offline buffering
    pub fn buffering(mut self, on: bool) -> Self {
        self.buffer_while_disconnected = on;
        self
    }
}

/// On-disk schema (all fields optional, defaulting to the built-ins)
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct FileConfig {
    keepalive_interval_secs: u64,
    idle_timeout_secs: u64,
    delivery_timeout_secs: u64,
    buffer_while_disconnected: bool,
    reconnect: FileReconnect,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            idle_timeout_secs: 90,
            delivery_timeout_secs: 120,
            buffer_while_disconnected: true,
            reconnect: FileReconnect::default(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct FileReconnect {
    base_delay_secs: u64,
    max_delay_secs: u64,
    max_attempts: u32,
}

impl Default for FileReconnect {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 30,
            max_attempts: 10,
        }
    }
}
