//! Read-side storage facades.
//!
//! - `ReadingReader`: time-range queries, latest-N, device listing and energy usage per device
//! - `EventReader`: query persisted system events

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use strum_macros::{AsRefStr, EnumString};

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{DeviceClass, Event, EventKind, EventSeverity, Measurements, Reading};

// =============================================================================
// Constants
// =============================================================================

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;
const DEFAULT_RANGE_DAYS: i64 = 30;

// =============================================================================
// Query Types
// =============================================================================

/// Sort order for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Query for readings of one device class.
///
/// Without `start`/`end` the window is the last 30 days.
#[derive(Debug, Clone)]
pub struct ReadingQuery {
    pub class: DeviceClass,
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

impl ReadingQuery {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            device_id: None,
            start: None,
            end: None,
            limit: None,
            order: None,
        }
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = Some(order);
        self
    }
}

/// Query for events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub kind: Option<EventKind>,
    pub severity: Option<EventSeverity>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

/// Energy consumed by one device over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyUsage {
    pub device_id: String,
    /// Timestamp of the first reading in the window.
    pub start: DateTime<Utc>,
    /// Timestamp of the last reading in the window.
    pub end: DateTime<Utc>,
    pub start_energy: f64,
    pub end_energy: f64,
    /// kWh consumed, summed across meter reset segments.
    pub consumed_kwh: f64,
    pub duration_hours: f64,
    /// Average power in kW; `None` for a zero-length window.
    pub average_kw: Option<f64>,
    /// Number of flagged meter resets inside the window.
    pub resets: u32,
}

// =============================================================================
// Readers
// =============================================================================

/// Reader over the per-class reading tables.
#[derive(Clone)]
pub struct ReadingReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for ReadingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingReader").finish_non_exhaustive()
    }
}

impl ReadingReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Query readings with filters.
    pub async fn query(&self, q: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        let now = Utc::now();
        let start = q
            .start
            .unwrap_or_else(|| now - Duration::days(DEFAULT_RANGE_DAYS));
        let end = q.end.unwrap_or(now);
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let order = q.order.unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE timestamp >= ",
            q.class.table()
        ));
        qb.push_bind(start.timestamp_micros());
        qb.push(" AND timestamp <= ");
        qb.push_bind(end.timestamp_micros());
        if let Some(device_id) = q.device_id {
            qb.push(" AND device_id = ");
            qb.push_bind(device_id);
        }
        qb.push(format!(
            " ORDER BY timestamp {} LIMIT {}",
            order.as_sql(),
            limit
        ));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(|row| map_reading(q.class, row)).collect()
    }

    /// Most recent `n` readings of one device, newest first.
    pub async fn latest(
        &self,
        class: DeviceClass,
        device_id: &str,
        n: u32,
    ) -> Result<Vec<Reading>, StorageError> {
        let sql = format!(
            "SELECT * FROM {} WHERE device_id = ? ORDER BY timestamp DESC LIMIT ?",
            class.table()
        );
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(i64::from(n.min(MAX_LIMIT)))
            .fetch_all(self.pool.inner())
            .await?;
        rows.iter().map(|row| map_reading(class, row)).collect()
    }

    /// Device ids that have stored readings of `class`, sorted.
    pub async fn devices(&self, class: DeviceClass) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "SELECT DISTINCT device_id FROM {} ORDER BY device_id",
            class.table()
        );
        let ids: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(self.pool.inner()).await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Energy consumed by a device between `start` and `end`.
    ///
    /// A row flagged `meter_reset` starts a new counter segment: its own value
    /// counts as energy accrued since the reset. Returns `None` when the window
    /// holds fewer than two readings with an energy value.
    pub async fn energy_usage(
        &self,
        class: DeviceClass,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<EnergyUsage>, StorageError> {
        let Some(column) = class.energy_column() else {
            return Err(StorageError::InvalidData(format!(
                "{class} readings carry no energy counter"
            )));
        };
        let sql = format!(
            "SELECT timestamp, {column}, meter_reset FROM {} \
             WHERE device_id = ? AND timestamp >= ? AND timestamp <= ? AND {column} IS NOT NULL \
             ORDER BY timestamp ASC",
            class.table()
        );
        let rows: Vec<(i64, f64, bool)> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(start.timestamp_micros())
            .bind(end.timestamp_micros())
            .fetch_all(self.pool.inner())
            .await?;

        let samples: Vec<(DateTime<Utc>, f64, bool)> = rows
            .into_iter()
            .map(|(ts, kwh, reset)| micros_to_datetime(ts).map(|t| (t, kwh, reset)))
            .collect::<Result<_, _>>()?;
        Ok(summarize_energy(device_id, &samples))
    }
}

/// Event reader.
#[derive(Clone)]
pub struct EventReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for EventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader").finish_non_exhaustive()
    }
}

impl EventReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Query events with filters.
    pub async fn query(&self, q: EventQuery) -> Result<Vec<Event>, StorageError> {
        let now = Utc::now();
        let start = q
            .start
            .unwrap_or_else(|| now - Duration::days(DEFAULT_RANGE_DAYS));
        let end = q.end.unwrap_or(now);
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let order = q.order.unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, ts, source, kind, severity, message, payload FROM events WHERE ts >= ",
        );
        qb.push_bind(start.timestamp_micros());
        qb.push(" AND ts <= ");
        qb.push_bind(end.timestamp_micros());
        if let Some(source) = q.source {
            qb.push(" AND source = ");
            qb.push_bind(source);
        }
        if let Some(kind) = q.kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind.as_ref().to_string());
        }
        if let Some(severity) = q.severity {
            qb.push(" AND severity = ");
            qb.push_bind(severity.as_ref().to_string());
        }
        qb.push(format!(" ORDER BY ts {} LIMIT {}", order.as_sql(), limit));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(map_event).collect()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {micros}")))
}

pub(crate) fn map_reading(class: DeviceClass, row: &SqliteRow) -> Result<Reading, StorageError> {
    let values = match class {
        DeviceClass::Heatpump => Measurements::Heatpump {
            input_temp: row.try_get("input_temp")?,
            output_temp: row.try_get("output_temp")?,
            flow: row.try_get("flow")?,
            energy: row.try_get("energy")?,
            meter_reset: row.try_get("meter_reset")?,
        },
        DeviceClass::Groundpipe => Measurements::Groundpipe {
            input_temp: row.try_get("input_temp")?,
            output_temp: row.try_get("output_temp")?,
            flow: row.try_get("flow")?,
        },
        DeviceClass::Elec => Measurements::Elec {
            total_energy: row.try_get("total_energy")?,
            meter_reset: row.try_get("meter_reset")?,
        },
    };
    Ok(Reading {
        device_id: row.try_get("device_id")?,
        timestamp: micros_to_datetime(row.try_get("timestamp")?)?,
        values,
    })
}

fn map_event(row: &SqliteRow) -> Result<Event, StorageError> {
    let kind: String = row.try_get("kind")?;
    let severity: String = row.try_get("severity")?;
    let payload: Option<String> = row.try_get("payload")?;
    let payload = match payload.as_deref() {
        None | Some("") | Some("{}") => None,
        Some(raw) => Some(serde_json::from_str(raw)?),
    };

    Ok(Event {
        id: row.try_get("id")?,
        ts: micros_to_datetime(row.try_get("ts")?)?,
        source: row.try_get("source")?,
        kind: EventKind::from_str(&kind)
            .map_err(|_| StorageError::InvalidData(format!("unknown event kind '{kind}'")))?,
        severity: EventSeverity::from_str(&severity).map_err(|_| {
            StorageError::InvalidData(format!("unknown event severity '{severity}'"))
        })?,
        message: row.try_get("message")?,
        payload,
    })
}

/// Sum consumption over time-ordered `(timestamp, kWh, meter_reset)` samples.
fn summarize_energy(
    device_id: &str,
    samples: &[(DateTime<Utc>, f64, bool)],
) -> Option<EnergyUsage> {
    let (first, rest) = samples.split_first()?;
    let last = rest.last()?;

    let mut consumed = 0.0;
    let mut resets = 0;
    let mut prev = first.1;
    for &(_, kwh, reset) in rest {
        if reset {
            resets += 1;
            consumed += kwh;
        } else {
            consumed += (kwh - prev).max(0.0);
        }
        prev = kwh;
    }

    let duration_hours = (last.0 - first.0).num_milliseconds() as f64 / 3_600_000.0;
    Some(EnergyUsage {
        device_id: device_id.to_string(),
        start: first.0,
        end: last.0,
        start_energy: first.1,
        end_energy: last.1,
        consumed_kwh: consumed,
        duration_hours,
        average_kw: (duration_hours > 0.0).then(|| consumed / duration_hours),
        resets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;
    use crate::storage::store::{ReadingStore, SqliteStore};
    use tempfile::tempdir;

    async fn setup(dir: &tempfile::TempDir) -> (SqliteStore, ReadingReader, EventReader) {
        let path = dir.path().join("facades.db");
        let pool = SqlitePool::connect(&format!("sqlite:{}", path.display()))
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        (
            SqliteStore::new(pool.clone()),
            ReadingReader::new(pool.clone()),
            EventReader::new(pool),
        )
    }

    /// Storage keeps microseconds; keep test timestamps comparable.
    fn now_micros() -> DateTime<Utc> {
        DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap()
    }

    fn pipe(id: &str, ts: DateTime<Utc>, flow: f64) -> Reading {
        Reading {
            device_id: id.to_string(),
            timestamp: ts,
            values: Measurements::Groundpipe {
                input_temp: 12.0,
                output_temp: 9.0,
                flow,
            },
        }
    }

    fn meter(ts: DateTime<Utc>, kwh: f64, reset: bool) -> Reading {
        Reading {
            device_id: "EM_1".to_string(),
            timestamp: ts,
            values: Measurements::Elec {
                total_energy: kwh,
                meter_reset: reset,
            },
        }
    }

    #[tokio::test]
    async fn test_reading_query_filters_and_order() {
        let dir = tempdir().unwrap();
        let (store, reader, _) = setup(&dir).await;
        let t0 = now_micros() - Duration::minutes(10);
        let rows: Vec<_> = (0..4)
            .map(|i| pipe("GP_1", t0 + Duration::seconds(i * 60), i as f64))
            .chain([pipe("GP_2", t0, 99.0)])
            .collect();
        store
            .insert_batch(DeviceClass::Groundpipe, &rows)
            .await
            .unwrap();

        let asc = reader
            .query(
                ReadingQuery::new(DeviceClass::Groundpipe)
                    .device("GP_1")
                    .order(SortOrder::Asc),
            )
            .await
            .unwrap();
        assert_eq!(asc.len(), 4);
        assert!(asc.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(asc[0], rows[0]);

        let window = reader
            .query(
                ReadingQuery::new(DeviceClass::Groundpipe)
                    .between(t0 + Duration::seconds(30), t0 + Duration::seconds(150))
                    .limit(10),
            )
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_devices_lists_distinct_ids() {
        let dir = tempdir().unwrap();
        let (store, reader, _) = setup(&dir).await;
        let t0 = now_micros();
        let rows = vec![
            pipe("GP_2", t0, 1.0),
            pipe("GP_1", t0, 2.0),
            pipe("GP_2", t0 + Duration::seconds(5), 3.0),
        ];
        store
            .insert_batch(DeviceClass::Groundpipe, &rows)
            .await
            .unwrap();

        assert_eq!(
            reader.devices(DeviceClass::Groundpipe).await.unwrap(),
            ["GP_1", "GP_2"]
        );
        assert!(reader.devices(DeviceClass::Elec).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_returns_newest_first() {
        let dir = tempdir().unwrap();
        let (store, reader, _) = setup(&dir).await;
        let t0 = now_micros();
        let rows: Vec<_> = (0..5)
            .map(|i| pipe("GP_1", t0 + Duration::seconds(i), i as f64))
            .collect();
        store
            .insert_batch(DeviceClass::Groundpipe, &rows)
            .await
            .unwrap();

        let latest = reader
            .latest(DeviceClass::Groundpipe, "GP_1", 2)
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0], rows[4]);
        assert_eq!(latest[1], rows[3]);
    }

    #[tokio::test]
    async fn test_energy_usage_across_reset() {
        let dir = tempdir().unwrap();
        let (store, reader, _) = setup(&dir).await;
        let t0 = Utc::now() - Duration::hours(3);
        let rows = vec![
            meter(t0, 100.0, false),
            meter(t0 + Duration::hours(1), 104.0, false),
            meter(t0 + Duration::hours(2), 1.5, true),
            meter(t0 + Duration::hours(3), 3.0, false),
        ];
        store.insert_batch(DeviceClass::Elec, &rows).await.unwrap();

        let usage = reader
            .energy_usage(
                DeviceClass::Elec,
                "EM_1",
                t0 - Duration::minutes(1),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!((usage.consumed_kwh - 7.0).abs() < 1e-9);
        assert!((usage.duration_hours - 3.0).abs() < 1e-9);
        assert_eq!(usage.resets, 1);
        assert!((usage.average_kw.unwrap() - 7.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_energy_usage_requires_energy_class() {
        let dir = tempdir().unwrap();
        let (_, reader, _) = setup(&dir).await;
        let result = reader
            .energy_usage(DeviceClass::Groundpipe, "GP_1", Utc::now(), Utc::now())
            .await;
        assert!(matches!(result, Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn test_summarize_energy_single_sample() {
        let t0 = Utc::now();
        assert!(summarize_energy("EM_1", &[(t0, 5.0, false)]).is_none());
        assert!(summarize_energy("EM_1", &[]).is_none());
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let dir = tempdir().unwrap();
        let (store, _, events) = setup(&dir).await;
        store
            .insert_events(&[
                Event::new(
                    "supervisor",
                    EventKind::System,
                    EventSeverity::Info,
                    "Supervisor started",
                ),
                Event::new(
                    "ingest.writer",
                    EventKind::DataLoss,
                    EventSeverity::Error,
                    "Dropped 4 heatpump readings",
                )
                .with_payload(serde_json::json!({ "rows": 4 })),
            ])
            .await
            .unwrap();

        let all = events.query(EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let loss = events
            .query(EventQuery {
                kind: Some(EventKind::DataLoss),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(loss.len(), 1);
        assert_eq!(loss[0].source, "ingest.writer");
        assert_eq!(loss[0].payload.as_ref().unwrap()["rows"], 4);
        assert_eq!(loss[0].severity, EventSeverity::Error);
    }
}
