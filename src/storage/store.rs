//! Write-side store used by the batch writer.
//!
//! [`ReadingStore`] is the seam between the ingest pipeline and the database.
//! [`SqliteStore`] is the production implementation; tests plug in doubles.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::facades::map_reading;
use crate::storage::types::{DeviceClass, Event, Measurements, Reading};

/// SQLite caps bound parameters per statement; 8 columns x 100 rows stays well below.
const ROWS_PER_STATEMENT: usize = 100;

/// Durable sink for validated readings.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Write all readings of one class atomically.
    ///
    /// Returns the number of rows actually inserted. Rows whose
    /// `(device_id, timestamp)` already exist are skipped, not duplicated.
    async fn insert_batch(&self, class: DeviceClass, readings: &[Reading])
    -> Result<u64, StorageError>;

    /// Newest persisted timestamp per device across all tables.
    async fn last_timestamps(&self) -> Result<HashMap<String, DateTime<Utc>>, StorageError>;

    /// Newest persisted reading per device, used to resume baselines after a restart.
    async fn last_readings(&self) -> Result<HashMap<String, Reading>, StorageError>;

    /// Persist system events.
    async fn insert_events(&self, events: &[Event]) -> Result<(), StorageError>;

    /// Delete readings and events older than `cutoff`. Returns rows removed.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// [`ReadingStore`] backed by the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn insert_prefix(class: DeviceClass) -> &'static str {
    match class {
        DeviceClass::Heatpump => {
            "INSERT OR IGNORE INTO heatpump (device_id, timestamp, input_temp, output_temp, flow, energy, meter_reset, created_at) "
        }
        DeviceClass::Groundpipe => {
            "INSERT OR IGNORE INTO groundpipe (device_id, timestamp, input_temp, output_temp, flow, created_at) "
        }
        DeviceClass::Elec => {
            "INSERT OR IGNORE INTO elec (device_id, timestamp, total_energy, meter_reset, created_at) "
        }
    }
}

#[async_trait::async_trait]
impl ReadingStore for SqliteStore {
    async fn insert_batch(
        &self,
        class: DeviceClass,
        readings: &[Reading],
    ) -> Result<u64, StorageError> {
        if readings.is_empty() {
            return Ok(0);
        }
        if let Some(stray) = readings.iter().find(|r| r.class() != class) {
            return Err(StorageError::InvalidData(format!(
                "{} reading from '{}' in a {} batch",
                stray.class(),
                stray.device_id,
                class
            )));
        }

        let created_at = Utc::now().timestamp_micros();
        let mut inserted = 0;
        let mut tx = self.pool.inner().begin().await?;

        for chunk in readings.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(insert_prefix(class));
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.device_id.clone())
                    .push_bind(r.timestamp.timestamp_micros());
                match r.values {
                    Measurements::Heatpump {
                        input_temp,
                        output_temp,
                        flow,
                        energy,
                        meter_reset,
                    } => {
                        row.push_bind(input_temp)
                            .push_bind(output_temp)
                            .push_bind(flow)
                            .push_bind(energy)
                            .push_bind(meter_reset);
                    }
                    Measurements::Groundpipe {
                        input_temp,
                        output_temp,
                        flow,
                    } => {
                        row.push_bind(input_temp)
                            .push_bind(output_temp)
                            .push_bind(flow);
                    }
                    Measurements::Elec {
                        total_energy,
                        meter_reset,
                    } => {
                        row.push_bind(total_energy).push_bind(meter_reset);
                    }
                }
                row.push_bind(created_at);
            });
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        tracing::debug!(table = class.table(), rows = inserted, "Batch committed");
        Ok(inserted)
    }

    async fn last_timestamps(&self) -> Result<HashMap<String, DateTime<Utc>>, StorageError> {
        let mut latest = HashMap::new();
        for class in DeviceClass::ALL {
            let sql = format!(
                "SELECT device_id, MAX(timestamp) FROM {} GROUP BY device_id",
                class.table()
            );
            let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
                .fetch_all(self.pool.inner())
                .await?;
            for (device_id, micros) in rows {
                let Some(ts) = DateTime::from_timestamp_micros(micros) else {
                    continue;
                };
                latest
                    .entry(device_id)
                    .and_modify(|cur: &mut DateTime<Utc>| *cur = (*cur).max(ts))
                    .or_insert(ts);
            }
        }
        Ok(latest)
    }

    async fn last_readings(&self) -> Result<HashMap<String, Reading>, StorageError> {
        let mut latest: HashMap<String, Reading> = HashMap::new();
        for class in DeviceClass::ALL {
            let sql = format!(
                "SELECT t.* FROM {table} t \
                 JOIN (SELECT device_id, MAX(timestamp) AS ts FROM {table} GROUP BY device_id) m \
                 ON t.device_id = m.device_id AND t.timestamp = m.ts",
                table = class.table()
            );
            let rows = sqlx::query(&sql).fetch_all(self.pool.inner()).await?;
            for row in &rows {
                let reading = map_reading(class, row)?;
                match latest.get(&reading.device_id) {
                    Some(cur) if cur.timestamp >= reading.timestamp => {}
                    _ => {
                        latest.insert(reading.device_id.clone(), reading);
                    }
                }
            }
        }
        Ok(latest)
    }

    async fn insert_events(&self, events: &[Event]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.inner().begin().await?;
        for e in events {
            let payload = match &e.payload {
                Some(p) => serde_json::to_string(p)?,
                None => "{}".to_string(),
            };
            sqlx::query(
                "INSERT INTO events (ts, source, kind, severity, message, payload)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(e.ts.timestamp_micros())
            .bind(&e.source)
            .bind(e.kind.as_ref())
            .bind(e.severity.as_ref())
            .bind(&e.message)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let cutoff = cutoff.timestamp_micros();
        let mut deleted = 0;
        for class in DeviceClass::ALL {
            let sql = format!("DELETE FROM {} WHERE timestamp < ?", class.table());
            deleted += sqlx::query(&sql)
                .bind(cutoff)
                .execute(self.pool.inner())
                .await?
                .rows_affected();
        }
        deleted += sqlx::query("DELETE FROM events WHERE ts < ?")
            .bind(cutoff)
            .execute(self.pool.inner())
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;
    use crate::storage::types::{EventKind, EventSeverity};
    use chrono::Duration;
    use tempfile::tempdir;

    async fn store(dir: &tempfile::TempDir) -> SqliteStore {
        let path = dir.path().join("store.db");
        let pool = SqlitePool::connect(&format!("sqlite:{}", path.display()))
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn elec(id: &str, ts: DateTime<Utc>, kwh: f64) -> Reading {
        Reading {
            device_id: id.to_string(),
            timestamp: ts,
            values: Measurements::Elec {
                total_energy: kwh,
                meter_reset: false,
            },
        }
    }

    fn heatpump(id: &str, ts: DateTime<Utc>, energy: Option<f64>) -> Reading {
        Reading {
            device_id: id.to_string(),
            timestamp: ts,
            values: Measurements::Heatpump {
                input_temp: 35.0,
                output_temp: 30.0,
                flow: 12.5,
                energy,
                meter_reset: false,
            },
        }
    }

    #[tokio::test]
    async fn test_insert_batch_and_last_timestamps() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let t0 = Utc::now();

        let rows = vec![
            heatpump("HP_1", t0, Some(10.0)),
            heatpump("HP_1", t0 + Duration::seconds(5), None),
            heatpump("HP_2", t0, Some(3.0)),
        ];
        assert_eq!(
            store
                .insert_batch(DeviceClass::Heatpump, &rows)
                .await
                .unwrap(),
            3
        );
        store
            .insert_batch(DeviceClass::Elec, &[elec("EM_1", t0, 1.0)])
            .await
            .unwrap();

        let latest = store.last_timestamps().await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(
            latest["HP_1"].timestamp_micros(),
            (t0 + Duration::seconds(5)).timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_last_readings_per_device() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        store
            .insert_batch(
                DeviceClass::Elec,
                &[
                    elec("EM_1", t0, 480.0),
                    elec("EM_1", t0 + Duration::seconds(60), 500.0),
                    elec("EM_2", t0, 7.5),
                ],
            )
            .await
            .unwrap();
        store
            .insert_batch(
                DeviceClass::Heatpump,
                &[heatpump("HP_1", t0 + Duration::seconds(5), Some(10.0))],
            )
            .await
            .unwrap();

        let latest = store.last_readings().await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest["EM_1"].energy(), Some(500.0));
        assert_eq!(latest["EM_1"].timestamp, t0 + Duration::seconds(60));
        assert_eq!(latest["EM_2"].energy(), Some(7.5));
        assert_eq!(latest["HP_1"].class(), DeviceClass::Heatpump);
    }

    #[tokio::test]
    async fn test_replayed_batch_inserts_nothing() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let rows = vec![elec("EM_1", Utc::now(), 5.0)];

        assert_eq!(store.insert_batch(DeviceClass::Elec, &rows).await.unwrap(), 1);
        assert_eq!(store.insert_batch(DeviceClass::Elec, &rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mixed_class_batch_rejected() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let rows = vec![elec("EM_1", Utc::now(), 5.0)];

        let err = store
            .insert_batch(DeviceClass::Heatpump, &rows)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_large_batch_spans_statements() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let t0 = Utc::now();
        let rows: Vec<_> = (0..250)
            .map(|i| elec("EM_1", t0 + Duration::seconds(i), i as f64))
            .collect();

        assert_eq!(
            store.insert_batch(DeviceClass::Elec, &rows).await.unwrap(),
            250
        );
    }

    #[tokio::test]
    async fn test_events_and_retention() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let old = Utc::now() - Duration::days(400);

        let mut stale = Event::new(
            "supervisor",
            EventKind::System,
            EventSeverity::Info,
            "Supervisor started",
        );
        stale.ts = old;
        let fresh = Event::new(
            "ingest.writer",
            EventKind::DataLoss,
            EventSeverity::Error,
            "Dropped 3 readings",
        )
        .with_payload(serde_json::json!({ "rows": 3 }));
        store.insert_events(&[stale, fresh]).await.unwrap();
        store
            .insert_batch(DeviceClass::Elec, &[elec("EM_1", old, 1.0)])
            .await
            .unwrap();

        let deleted = store
            .delete_before(Utc::now() - Duration::days(365))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.last_timestamps().await.unwrap().is_empty());
    }
}
