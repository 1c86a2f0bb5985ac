//! Server configuration.
//!
//! Configuration is layered:
//! - serde defaults for every field
//! - the first TOML file found in [`CONFIG_PATHS`]
//! - environment variables (`COURIER__DELIVERY__MAILBOX_CAPACITY=32`)
//!
//! `COURIER_HOST` and `COURIER_PORT` are honoured as defaults for the
//! listen address.

use anyhow::{Context, Result};
use courier_core::EngineConfig;
use courier_protocol::WireFormat;
use courier_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files searched for configuration, in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

const ENV_PREFIX: &str = "COURIER";
const ENV_SEPARATOR: &str = "__";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Delivery engine tuning.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Message store.
    #[serde(default)]
    pub store: StoreConfig,

    /// How connections are mapped to identities.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// History endpoint paging.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Encoding of frames written to clients.
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Delivery engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Outbound mailbox capacity per connection.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// How far back reconnect sweeps look, in seconds.
    #[serde(default = "default_undelivered_window")]
    pub undelivered_window_secs: u64,

    /// How long a sweep waits for mailbox capacity, in milliseconds.
    #[serde(default = "default_sweep_timeout")]
    pub sweep_enqueue_timeout_ms: u64,
}

/// Storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// Embedded sled database.
    Sled,
}

/// Message store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database directory for the sled backend.
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// Identity resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Header set by the authenticating proxy.
    #[serde(default = "default_identity_header")]
    pub header: String,

    /// Also accept `?user_id=` on the upgrade request.
    #[serde(default)]
    pub allow_query_param: bool,
}

/// History endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Page size when the request has no `limit`.
    #[serde(default = "default_history_limit")]
    pub default_limit: usize,

    /// Upper bound on `limit`.
    #[serde(default = "default_history_max_limit")]
    pub max_limit: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_mailbox_capacity() -> usize {
    courier_core::DEFAULT_MAILBOX_CAPACITY
}

fn default_undelivered_window() -> u64 {
    5 * 24 * 60 * 60 // 5 days
}

fn default_sweep_timeout() -> u64 {
    2_000
}

fn default_store_path() -> String {
    "courier.db".to_string()
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

fn default_history_limit() -> usize {
    20
}

fn default_history_max_limit() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            delivery: DeliveryConfig::default(),
            store: StoreConfig::default(),
            identity: IdentityConfig::default(),
            history: HistoryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            wire_format: WireFormat::default(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            undelivered_window_secs: default_undelivered_window(),
            sweep_enqueue_timeout_ms: default_sweep_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            header: default_identity_header(),
            allow_query_param: false,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_history_limit(),
            max_limit: default_history_max_limit(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(path.as_deref(), environment())
    }

    /// Load configuration from `path`, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = PathBuf::from(shellexpand::tilde(&path.as_ref().to_string_lossy()).as_ref());
        Self::layered(Some(&path), environment())
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    fn layered(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(env)
            .build()
            .context("Failed to load configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Delivery engine settings.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            mailbox_capacity: self.delivery.mailbox_capacity,
            undelivered_window: Duration::from_secs(self.delivery.undelivered_window_secs),
            sweep_enqueue_timeout: Duration::from_millis(self.delivery.sweep_enqueue_timeout_ms),
        }
    }

    /// WebSocket transport settings.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            wire_format: self.transport.wire_format,
            max_message_size: self.transport.max_message_size,
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
