//! Configuration management for slidelog.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `SLIDELOG__<SECTION>__<KEY>` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::{CountMode, FailurePolicy, WindowConfig};

/// Main configuration for the slidelog service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidelogConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Event store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Trailing window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Requests allowed per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Whether the count runs inside the store transaction
    #[serde(default)]
    pub count_mode: CountMode,

    /// Handling of store failures
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            limit: default_limit(),
            count_mode: CountMode::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_limit() -> u64 {
    10
}

impl RateLimitingConfig {
    /// Validated window configuration.
    pub fn window_config(&self) -> Result<WindowConfig> {
        WindowConfig::new(Duration::from_millis(self.window_ms), self.limit)
    }
}

/// Which event store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single-process, in-memory store
    Memory,
    /// Shared Redis sorted sets
    #[default]
    Redis,
}

/// Event store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on each store round trip in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "slidelog:".to_string()
}

fn default_response_timeout_ms() -> u64 {
    1000
}

impl StoreConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SlidelogConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SLIDELOG")
                .prefix_separator("__")
                .separator("__"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
