//! Configuration for the usher core.
//!
//! Configuration is read from a JSON file (`usher.json`), with `USHER_*`
//! environment variables overriding file values and built-in defaults
//! filling anything left unset.
//!
//! # Environment Variable Mapping
//!
//! ## Admission
//! - `USHER_MAX_CONCURRENT_REQUESTS` → admission.max_concurrent_requests
//! - `USHER_MAX_QUEUE_SIZE` → admission.max_queue_size
//! - `USHER_RATE_LIMIT_PER_MINUTE` → admission.rate_limit_per_minute
//! - `USHER_REQUEST_TIMEOUT_SECS` → admission.request_timeout_secs
//!
//! ## Sessions
//! - `USHER_MAX_HISTORY_SIZE` → session.max_history_size
//! - `USHER_RETENTION_PERIOD_DAYS` → session.retention_period_days
//!
//! ## Observability
//! - `USHER_LOG_LEVEL` → observability.log_level
//! - `USHER_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".usher"),
        |dirs| dirs.home_dir().join(".usher"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("usher.json")
}

// ============================================================================
// Admission Configuration
// ============================================================================

/// Limits applied by the admission controller.
///
/// All limits can be swapped at runtime via `AdmissionController::reconfigure`;
/// new values apply to subsequently admitted requests only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum requests executing at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Maximum requests waiting for a slot before new arrivals are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Accepted requests allowed per rolling 60-second window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    /// Maximum time a request may wait in the queue.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// When false, saturated arrivals are rejected instead of queued.
    #[serde(default = "default_true")]
    pub enable_queuing: bool,

    /// When false, the rate gate is skipped entirely.
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            rate_limit_per_minute: default_rate_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            enable_queuing: true,
            enable_rate_limiting: true,
        }
    }
}

impl AdmissionConfig {
    /// Queue-wait timeout as a [`Duration`].
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject nonsensical limit combinations.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_concurrent_requests > 0,
            "admission.max_concurrent_requests must be at least 1"
        );
        anyhow::ensure!(
            !self.enable_rate_limiting || self.rate_limit_per_minute > 0,
            "admission.rate_limit_per_minute must be at least 1 when rate limiting is enabled"
        );
        anyhow::ensure!(
            self.request_timeout_secs > 0,
            "admission.request_timeout_secs must be at least 1"
        );
        Ok(())
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    100
}

fn default_rate_limit() -> u32 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Bounds on per-session conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum messages retained per session; oldest evicted first.
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,

    /// Maximum age a stored message may reach before mandatory deletion.
    #[serde(default = "default_retention_days")]
    pub retention_period_days: u64,

    /// Interval between automatic retention sweeps.
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    /// History messages handed to the generator as context per query.
    #[serde(default = "default_context_messages")]
    pub max_context_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history_size: default_max_history_size(),
            retention_period_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            max_context_messages: default_context_messages(),
        }
    }
}

impl SessionConfig {
    /// Retention period as a [`Duration`].
    pub const fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_days * 24 * 60 * 60)
    }

    /// Sweep interval as a [`Duration`].
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 60 * 60)
    }

    /// Reject nonsensical history bounds.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_history_size > 0,
            "session.max_history_size must be at least 1"
        );
        anyhow::ensure!(
            self.retention_period_days > 0,
            "session.retention_period_days must be at least 1"
        );
        Ok(())
    }
}

fn default_max_history_size() -> usize {
    100
}

fn default_retention_days() -> u64 {
    30
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

fn default_context_messages() -> usize {
    10
}

// ============================================================================
// Metrics Configuration
// ============================================================================

/// Retention and aggregation settings for the metrics recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Default aggregation window, in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Samples older than this are pruned.
    #[serde(default = "default_metrics_retention_hours")]
    pub retention_hours: u64,

    /// Hard cap on retained samples per shard.
    #[serde(default = "default_max_samples_per_shard")]
    pub max_samples_per_shard: usize,

    /// Number of write shards. More shards, less write contention.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            retention_hours: default_metrics_retention_hours(),
            max_samples_per_shard: default_max_samples_per_shard(),
            shards: default_shards(),
        }
    }
}

impl MetricsConfig {
    /// Default aggregation window as a [`Duration`].
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 60 * 60)
    }

    /// Sample retention as a [`Duration`].
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 60 * 60)
    }
}

fn default_window_hours() -> u64 {
    1
}

fn default_metrics_retention_hours() -> u64 {
    24
}

fn default_max_samples_per_shard() -> usize {
    16_384
}

fn default_shards() -> usize {
    8
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format: "json" for structured JSON, "pretty" for human-readable.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Top-level Configuration
// ============================================================================

/// Complete configuration for the usher core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Admission controller limits.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Session history bounds.
    #[serde(default)]
    pub session: SessionConfig,

    /// Metrics recorder settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when no file exists. Environment overrides always apply.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `USHER_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        read_env("USHER_MAX_CONCURRENT_REQUESTS", &mut self.admission.max_concurrent_requests);
        read_env("USHER_MAX_QUEUE_SIZE", &mut self.admission.max_queue_size);
        read_env("USHER_RATE_LIMIT_PER_MINUTE", &mut self.admission.rate_limit_per_minute);
        read_env("USHER_REQUEST_TIMEOUT_SECS", &mut self.admission.request_timeout_secs);
        read_env("USHER_MAX_HISTORY_SIZE", &mut self.session.max_history_size);
        read_env("USHER_RETENTION_PERIOD_DAYS", &mut self.session.retention_period_days);
        if let Ok(level) = std::env::var("USHER_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("USHER_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        self.admission.validate()?;
        self.session.validate()?;
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *target = value;
        } else {
            tracing::warn!(key, raw = %raw, "ignoring unparseable environment override");
        }
    }
}
