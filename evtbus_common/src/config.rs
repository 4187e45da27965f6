//! Configuration loading traits and types.
//!
//! Every evtbus process (input, worker, output, tools) reads the same TOML
//! layout: a `[shared]` table plus the transport tables `[ring]`, `[socket]`
//! and `[histogram]`. Missing tables fall back to the defaults in
//! [`crate::consts`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use evtbus_common::config::{ConfigError, ConfigLoader, SharedConfig, TransportConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct WorkerConfig {
//!     shared: SharedConfig,
//!     #[serde(flatten)]
//!     transport: TransportConfig,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = WorkerConfig::load(Path::new("worker.toml"))?;
//!     config.transport.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across all evtbus processes.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "worker-03"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Process instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[ring]` table: shared-memory ring buffer sizing and retry cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Circular region size in 4-byte words.
    pub capacity_words: usize,
    /// Sleep between `WouldBlock` retries, in microseconds.
    pub retry_interval_us: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity_words: DEFAULT_RING_CAPACITY_WORDS,
            retry_interval_us: DEFAULT_RETRY_INTERVAL_US,
        }
    }
}

impl RingConfig {
    /// Retry interval as a `Duration`.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_micros(self.retry_interval_us)
    }
}

/// `[socket]` table: acknowledgement timeout and reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Maximum wait for one event acknowledgement, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Read timeout used when polling a socket for frames, in milliseconds.
    pub poll_interval_ms: u64,
    /// Connect attempts before giving up.
    pub connect_retries: u32,
    /// First backoff between connect attempts, in milliseconds; doubled per attempt.
    pub connect_backoff_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_backoff_ms: DEFAULT_CONNECT_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl SocketConfig {
    /// Acknowledgement timeout as a `Duration`.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before connect attempt `attempt` (0-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .connect_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// `[histogram]` table: shared histogram table geometry and merge period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramConfig {
    /// Number of slots in the shared table.
    pub slots: usize,
    /// Bytes reserved for one serialized histogram.
    pub slot_bytes: usize,
    /// Period of the background merger, in milliseconds.
    pub merge_interval_ms: u64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_HIST_SLOTS,
            slot_bytes: DEFAULT_HIST_SLOT_BYTES,
            merge_interval_ms: DEFAULT_MERGE_INTERVAL_MS,
        }
    }
}

impl HistogramConfig {
    /// Merge period as a `Duration`.
    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_interval_ms)
    }
}

/// Transport configuration shared by every endpoint of a run.
///
/// # TOML Example
///
/// ```toml
/// marker_dir = "/var/tmp/evtbus"
///
/// [ring]
/// capacity_words = 1048576
/// retry_interval_us = 50
///
/// [socket]
/// ack_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Ring buffer settings.
    pub ring: RingConfig,
    /// Socket transport settings.
    pub socket: SocketConfig,
    /// Histogram table settings.
    pub histogram: HistogramConfig,
    /// Override of the directory holding discovery markers.
    pub marker_dir: Option<PathBuf>,
}

impl TransportConfig {
    /// Validate value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero ring capacity, a zero
    /// ack timeout or poll interval, or a histogram slot too small to hold a header.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring.capacity_words == 0 {
            return Err(ConfigError::ValidationError(
                "ring.capacity_words must be > 0".to_string(),
            ));
        }
        if self.socket.ack_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "socket.ack_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.socket.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "socket.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.histogram.slots == 0 || self.histogram.slot_bytes < 64 {
            return Err(ConfigError::ValidationError(format!(
                "histogram table too small: {} slots of {} bytes",
                self.histogram.slots, self.histogram.slot_bytes
            )));
        }
        Ok(())
    }

    /// Directory for discovery markers: `marker_dir`, else `$EVTBUS_TMPDIR`,
    /// else the host temporary directory.
    pub fn marker_dir(&self) -> PathBuf {
        resolve_marker_dir(self.marker_dir.as_deref())
    }
}

/// Resolve the marker directory from an optional explicit override.
pub fn resolve_marker_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    match std::env::var_os(MARKER_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation: any serde-deserializable struct can be loaded.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
