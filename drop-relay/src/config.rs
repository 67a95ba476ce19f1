//! Configuration loading for sharedrop-relay.
//!
//! Configuration is loaded from a TOML file given with `--config` or the
//! `SHAREDROP_CONFIG` environment variable. Every section and every field
//! is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SHAREDROP_CONFIG";

/// Root configuration for sharedrop-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Transfer limits and timeouts.
    #[serde(default)]
    pub transfers: TransferConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Reaper configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket (default: 0.0.0.0:5050).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// WebSocket ping interval in seconds (default: 25).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Messages buffered per peer before chunks are refused (default: 64).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Commands buffered in front of the dispatcher (default: 1024).
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    /// Largest accepted WebSocket frame in bytes (default: 1MB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Transfer limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Largest chunk payload in bytes (default: 128KB).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Largest file in bytes (default: 16GB).
    #[serde(default = "default_max_transfer_size")]
    pub max_transfer_size: u64,
    /// Seconds without activity before a transfer is reaped (default: 300).
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum new connections per IP address per minute (default: 30).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Maximum messages per peer per second (default: 200).
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
    /// Maximum messages per second across all peers (default: 5000).
    #[serde(default = "default_global_messages_per_second")]
    pub global_messages_per_second: u32,
    /// Maximum concurrent connections (default: 1000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Reaper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable the reaper (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:5050".to_string()
}

fn default_ping_interval() -> u64 {
    25
}

fn default_outbound_queue() -> usize {
    64
}

fn default_command_queue() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_chunk_size() -> usize {
    128 * 1024 // 128KB
}

fn default_max_transfer_size() -> u64 {
    16 * 1024 * 1024 * 1024 // 16GB
}

fn default_inactivity_timeout() -> u64 {
    300 // 5 minutes
}

fn default_connections_per_ip() -> u32 {
    30
}

fn default_messages_per_second() -> u32 {
    200
}

fn default_global_messages_per_second() -> u32 {
    5000
}

fn default_max_connections() -> usize {
    1000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ping_interval_secs: default_ping_interval(),
            outbound_queue: default_outbound_queue(),
            command_queue: default_command_queue(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_transfer_size: default_max_transfer_size(),
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

impl TransferConfig {
    /// Inactivity timeout as a [`Duration`].
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: default_connections_per_ip(),
            messages_per_second: default_messages_per_second(),
            global_messages_per_second: default_global_messages_per_second(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// value that must be positive is zero.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else from `$SHAREDROP_CONFIG`, else use defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.ping_interval_secs", self.server.ping_interval_secs),
            ("server.outbound_queue", self.server.outbound_queue as u64),
            ("server.command_queue", self.server.command_queue as u64),
            ("transfers.max_chunk_size", self.transfers.max_chunk_size as u64),
            ("transfers.inactivity_timeout_secs", self.transfers.inactivity_timeout_secs),
            ("limits.connections_per_ip", u64::from(self.limits.connections_per_ip)),
            ("limits.messages_per_second", u64::from(self.limits.messages_per_second)),
            (
                "limits.global_messages_per_second",
                u64::from(self.limits.global_messages_per_second),
            ),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
        ];
        match positive.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Invalid { field: *field }),
            None => Ok(()),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value must be greater than zero.
    #[error("{field} must be greater than zero")]
    Invalid {
        /// Offending key.
        field: &'static str,
    },
}
