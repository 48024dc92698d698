//! Application configuration structures.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceDescriptor;
use crate::ingest::{DEFAULT_CAPACITY, WritePolicy};
use crate::poller::{Backoff, PollerSettings};
use crate::storage::db::DEFAULT_MAX_CONNECTIONS;
use crate::supervisor::{DEFAULT_STAGGER, DEFAULT_STOP_GRACE, SupervisorSettings};

use super::devices::{DeviceConfig, DevicesConfig};
use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default poll interval (60 seconds).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default connect and per-transaction timeout (3 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/heatwatch.db";

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; `${VAR:-default}` is expanded.
    pub url: String,

    /// Pool size (default: 5).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_url(&self) -> String {
        expand_env_vars(&self.url)
    }
}

// =============================================================================
// Polling Configuration
// =============================================================================

/// Poller timing and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Poll interval for devices without their own.
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout of one request/response transaction.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Consecutive failures before a device is reported degraded.
    pub degraded_after: u32,

    /// Spacing between device start-ups.
    #[serde(with = "humantime_serde")]
    pub stagger: Duration,

    /// Time a poller gets to stop before it is aborted.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            default_interval: DEFAULT_INTERVAL,
            connect_timeout: DEFAULT_TIMEOUT,
            io_timeout: DEFAULT_TIMEOUT,
            backoff_base: backoff.base,
            backoff_max: backoff.max,
            degraded_after: PollerSettings::default().degraded_after,
            stagger: DEFAULT_STAGGER,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

// =============================================================================
// Ingest Configuration
// =============================================================================

/// Buffer and batch writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Queued readings that force an early flush.
    pub buffer_capacity: usize,

    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Write attempts per batch before it is dropped.
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_max: Duration,

    /// Delete rows older than this many days; kept forever when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let policy = WritePolicy::default();
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            flush_interval: policy.flush_interval,
            max_attempts: policy.max_attempts,
            retry_base: policy.backoff.base,
            retry_max: policy.backoff.max,
            retention_days: None,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Directory of additional device files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration and merge the devices found under `device_path`.
    ///
    /// `device_dir` replaces the file's `device_path` when given.
    pub fn load_with_device_path(
        path: impl AsRef<Path>,
        device_dir: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        if let Some(dir) = device_dir {
            config.device_path = Some(dir.to_string());
        }

        if let Some(ref device_dir) = config.device_path {
            tracing::info!("Loading devices from: {}", device_dir);
            let additional = DevicesConfig::load_from_dir(device_dir)?;
            config.devices.extend(additional.devices);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.resolved_url().trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database url must not be empty".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database max_connections must be positive".to_string(),
            ));
        }

        let p = &self.polling;
        for (name, value) in [
            ("default_interval", p.default_interval),
            ("connect_timeout", p.connect_timeout),
            ("io_timeout", p.io_timeout),
            ("backoff_base", p.backoff_base),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "polling {name} must be positive"
                )));
            }
        }
        if p.backoff_max < p.backoff_base {
            return Err(ConfigError::ValidationError(
                "polling backoff_max must not be below backoff_base".to_string(),
            ));
        }
        if p.degraded_after == 0 {
            return Err(ConfigError::ValidationError(
                "polling degraded_after must be at least 1".to_string(),
            ));
        }

        let i = &self.ingest;
        if i.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "ingest buffer_capacity must be positive".to_string(),
            ));
        }
        if i.flush_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "ingest flush_interval must be positive".to_string(),
            ));
        }
        if i.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "ingest max_attempts must be at least 1".to_string(),
            ));
        }
        if i.retry_max < i.retry_base {
            return Err(ConfigError::ValidationError(
                "ingest retry_max must not be below retry_base".to_string(),
            ));
        }
        if i.retention_days == Some(0) {
            return Err(ConfigError::ValidationError(
                "ingest retention_days must be positive when set".to_string(),
            ));
        }

        DevicesConfig {
            devices: self.devices.clone(),
        }
        .validate()
    }

    /// Descriptors of the enabled devices, in configuration order.
    pub fn device_descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.to_descriptor(self.polling.default_interval))
            .collect()
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let p = &self.polling;
        let i = &self.ingest;
        SupervisorSettings {
            poller: PollerSettings {
                backoff: Backoff::new(p.backoff_base, p.backoff_max),
                degraded_after: p.degraded_after,
            },
            write: WritePolicy {
                max_attempts: i.max_attempts,
                backoff: Backoff::new(i.retry_base, i.retry_max),
                flush_interval: i.flush_interval,
                retention: i
                    .retention_days
                    .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
            },
            buffer_capacity: i.buffer_capacity,
            stagger: p.stagger,
            stop_grace: p.stop_grace,
        }
    }
}
