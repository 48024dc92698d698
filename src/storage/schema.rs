//! Database schema definitions.
//!
//! One table per device class plus an `events` table. Timestamps are INTEGER
//! Unix microseconds. Every statement is idempotent.

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Heat pump readings. `energy` is NULL when no meter is wired to the pump.
pub const HEATPUMP_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS heatpump (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   TEXT    NOT NULL,
    timestamp   INTEGER NOT NULL,
    input_temp  REAL    NOT NULL,
    output_temp REAL    NOT NULL,
    flow        REAL    NOT NULL,
    energy      REAL,
    meter_reset INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heatpump_device_id ON heatpump (device_id);
CREATE INDEX IF NOT EXISTS idx_heatpump_timestamp ON heatpump (timestamp DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_heatpump_device_timestamp ON heatpump (device_id, timestamp DESC);
"#;

/// Ground pipe loop readings.
pub const GROUNDPIPE_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS groundpipe (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   TEXT    NOT NULL,
    timestamp   INTEGER NOT NULL,
    input_temp  REAL    NOT NULL,
    output_temp REAL    NOT NULL,
    flow        REAL    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_groundpipe_device_id ON groundpipe (device_id);
CREATE INDEX IF NOT EXISTS idx_groundpipe_timestamp ON groundpipe (timestamp DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_groundpipe_device_timestamp ON groundpipe (device_id, timestamp DESC);
"#;

/// Power meter readings.
pub const ELEC_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS elec (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id    TEXT    NOT NULL,
    timestamp    INTEGER NOT NULL,
    total_energy REAL    NOT NULL,
    meter_reset  INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_elec_device_id ON elec (device_id);
CREATE INDEX IF NOT EXISTS idx_elec_timestamp ON elec (timestamp DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_elec_device_timestamp ON elec (device_id, timestamp DESC);
"#;

/// System events (lifecycle, data loss).
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ts        INTEGER NOT NULL,
    source    TEXT    NOT NULL,
    kind      TEXT    NOT NULL,
    severity  TEXT    NOT NULL,
    message   TEXT    NOT NULL,
    payload   TEXT    DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts DESC);
"#;

/// Initialize the database schema.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [
        HEATPUMP_TABLE_DDL,
        GROUNDPIPE_TABLE_DDL,
        ELEC_TABLE_DDL,
        EVENTS_TABLE_DDL,
    ] {
        sqlx::raw_sql(ddl).execute(pool.inner()).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}
