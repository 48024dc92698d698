//! Storage Layer
//!
//! SQLite time-series store with one table per device class:
//! - **Write side**: [`ReadingStore`], used only by the batch writer
//! - **Read side**: [`ReadingReader`] / [`EventReader`] over a shared pool
//!
//! # Components
//!
//! - [`SqliteStore`]: Transactional multi-row inserts, duplicate-safe
//! - [`ReadingReader`]: Time-range, latest-N and energy usage queries
//! - [`EventReader`]: Persisted system events
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod builder;
pub mod db;
mod error;
mod facades;
mod schema;
mod store;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use error::StorageError;
pub use facades::{
    EnergyUsage, EventQuery, EventReader, ReadingQuery, ReadingReader, SortOrder,
};
pub use schema::init_schema;
pub use store::{ReadingStore, SqliteStore};
pub use types::{DeviceClass, Event, EventKind, EventSeverity, Measurements, Reading};
