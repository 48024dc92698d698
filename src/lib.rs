//! Heatwatch - Heat Pump Acquisition Library
//!
//! Polls heat pumps, ground pipe loops and power meters over Modbus RTU
//! gateways and persists their readings into SQLite. It can be embedded by a
//! UI or export tool, or run as the standalone `heatwatch` daemon.
//!
//! # Architecture
//!
//! - **Device**: Register maps, decoding and the Modbus RTU driver
//! - **Poller**: One task per device with backoff and health tracking
//! - **Normalize**: Range and plausibility checks producing typed readings
//! - **Ingest**: Shared buffer and the single batch writer
//! - **Supervisor**: Lifecycle, health snapshot, latest values, notifications
//! - **Storage**: SQLite schema, batched writes and read-side queries
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use heatwatch::{AppConfig, ModbusDriverFactory, StorageBuilder, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("configs/config.yaml")?;
//!     let storage = StorageBuilder::new(config.database.resolved_url()).build().await?;
//!     let factory = ModbusDriverFactory::new(config.polling.connect_timeout, config.polling.io_timeout);
//!
//!     let mut supervisor = Supervisor::new(
//!         config.device_descriptors(),
//!         Arc::clone(&storage.store),
//!         Arc::new(factory),
//!         config.supervisor_settings(),
//!     )?;
//!     supervisor.start().await?;
//!     // ...
//!     supervisor.stop().await?;
//!     storage.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod ingest;
pub mod normalize;
pub mod notification;
pub mod poller;
pub mod storage;
pub mod supervisor;

pub use config::{AppConfig, ConfigError};
pub use device::{DeviceDescriptor, Driver, DriverFactory, ModbusDriverFactory};
pub use ingest::{FlushReport, WriterStatsSnapshot};
pub use notification::Notification;
pub use poller::{DeviceHealth, HealthState};
pub use storage::{
    DeviceClass, Reading, ReadingQuery, ReadingReader, StorageBuilder, StorageError,
    StorageHandles,
};
pub use supervisor::{Supervisor, SupervisorError, SupervisorSettings};
