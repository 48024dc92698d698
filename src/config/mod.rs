//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Database settings (URL, pool size)
//! - Polling timeouts, backoff and start-up stagger
//! - Ingest buffer, flush, retry and retention settings
//! - Devices, inline and from a `device_path` directory

mod app;
mod devices;
mod validation;

pub use app::{AppConfig, DatabaseConfig, IngestConfig, PollingConfig};
pub use devices::{DeviceConfig, DevicesConfig, EnergyMeterConfig};
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{DEFAULT_DATABASE_URL, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};
pub use devices::{DEFAULT_GATEWAY_PORT, DEFAULT_METER_PORT};
