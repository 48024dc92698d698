//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::Path;
use std::sync::Arc;

use crate::storage::StorageError;
use crate::storage::db::{DEFAULT_MAX_CONNECTIONS, SqlitePool};
use crate::storage::schema::init_schema;
use crate::storage::{EventReader, ReadingReader, SqliteStore};

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    max_connections: u32,
}

impl StorageBuilder {
    /// Create a new storage builder for a `sqlite:` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Set the maximum number of pooled connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Connect, create the schema and return handles.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        if let Some(path) = sqlite_file_path(&self.url)
            && let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pool = SqlitePool::connect_with(&self.url, self.max_connections).await?;
        init_schema(&pool).await?;

        Ok(StorageHandles {
            store: Arc::new(SqliteStore::new(pool.clone())),
            readings: ReadingReader::new(pool.clone()),
            events: EventReader::new(pool.clone()),
            pool,
        })
    }
}

/// File path portion of a `sqlite:` URL, if it names a file.
fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty() && !path.starts_with(":memory:")).then_some(path)
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Write-side store, shared with the batch writer.
    pub store: Arc<SqliteStore>,
    /// Facade for reading readings.
    pub readings: ReadingReader,
    /// Facade for reading events.
    pub events: EventReader,
    pool: SqlitePool,
}

impl StorageHandles {
    /// Close the connection pool.
    ///
    /// The supervisor must be stopped first so the final flush can land.
    pub async fn shutdown(self) -> Result<(), StorageError> {
        if let Err(e) = self.pool.checkpoint().await {
            tracing::warn!(error = %e, "WAL checkpoint failed");
        }
        self.pool.close().await;
        tracing::info!("Storage closed");
        Ok(())
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::ReadingStore;
    use crate::storage::types::{DeviceClass, Measurements, Reading};
    use crate::storage::{ReadingQuery, SortOrder};
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(sqlite_file_path("sqlite:data/hw.db"), Some("data/hw.db"));
        assert_eq!(
            sqlite_file_path("sqlite:///var/lib/hw.db?mode=rwc"),
            Some("/var/lib/hw.db")
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://localhost/hw"), None);
    }

    #[tokio::test]
    async fn test_storage_builder_creates_directory() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("data").join("hw.db");
        let url = format!("sqlite:{}", db_path.display());

        let handles = StorageBuilder::new(url)
            .max_connections(2)
            .build()
            .await
            .unwrap();
        assert!(db_path.exists());
        assert!(!handles.is_closed());
        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("roundtrip.db").display());
        let ts = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();

        {
            let handles = StorageBuilder::new(url.clone()).build().await.unwrap();
            let reading = Reading {
                device_id: "EM_1".to_string(),
                timestamp: ts,
                values: Measurements::Elec {
                    total_energy: 42.5,
                    meter_reset: false,
                },
            };
            handles
                .store
                .insert_batch(DeviceClass::Elec, &[reading])
                .await
                .unwrap();
            handles.shutdown().await.unwrap();
        }

        // Reopen: the schema step must not clobber existing rows.
        let handles = StorageBuilder::new(url).build().await.unwrap();
        let rows = handles
            .readings
            .query(
                ReadingQuery::new(DeviceClass::Elec)
                    .device("EM_1")
                    .order(SortOrder::Asc),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, ts);
        assert_eq!(rows[0].energy(), Some(42.5));
        handles.shutdown().await.unwrap();
    }
}
