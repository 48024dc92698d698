//! Batch writer task.
//!
//! Sole writer to the store. Drains the ingestion buffer on a timer or when the
//! buffer asks for it, and writes one transactional batch per device class.
//! Failed writes are retried with backoff; rows that exhaust the attempt
//! budget are dropped and reported as data loss.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::ingest::buffer::IngestionBuffer;
use crate::notification::{DataLoss, Notification, NotificationSender, publish};
use crate::poller::Backoff;
use crate::storage::{
    DeviceClass, Event, EventKind, EventSeverity, Reading, ReadingStore, StorageError,
};

// =============================================================================
// Constants
// =============================================================================

/// Events waiting for a healthy store; oldest are dropped beyond this.
const MAX_PENDING_EVENTS: usize = 256;

/// How often retention runs when enabled.
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const EVENT_SOURCE: &str = "ingest.writer";

// =============================================================================
// Policy, Stats & Commands
// =============================================================================

/// How the writer flushes and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Attempts per batch, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub flush_interval: Duration,
    /// Delete rows older than this, checked once a day.
    pub retention: Option<Duration>,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(10)),
            flush_interval: Duration::from_secs(5),
            retention: None,
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Rows inserted.
    pub committed: u64,
    /// Rows not written because an equal or newer row for the device exists.
    pub skipped: u64,
    /// Rows given up on after the last attempt.
    pub dropped: u64,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.committed += other.committed;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }
}

/// Running counters, shared with the writer's handle.
#[derive(Debug, Default)]
pub struct WriterStats {
    flushes: AtomicU64,
    rows_committed: AtomicU64,
    rows_skipped: AtomicU64,
    rows_dropped: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStatsSnapshot {
    pub flushes: u64,
    pub rows_committed: u64,
    pub rows_skipped: u64,
    pub rows_dropped: u64,
    pub retries: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            rows_committed: self.rows_committed.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &FlushReport) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.rows_committed
            .fetch_add(report.committed, Ordering::Relaxed);
        self.rows_skipped.fetch_add(report.skipped, Ordering::Relaxed);
        self.rows_dropped.fetch_add(report.dropped, Ordering::Relaxed);
    }
}

/// Commands sent to the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    /// Flush now and report.
    Flush(oneshot::Sender<FlushReport>),
    /// Queue a system event for the next successful flush.
    RecordEvent(Event),
    /// Final flush, then exit.
    Shutdown(oneshot::Sender<FlushReport>),
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("batch writer is not running")]
    Closed,
    #[error("batch writer command queue is full")]
    Full,
}

// =============================================================================
// Writer
// =============================================================================

pub struct BatchWriter<S: ReadingStore> {
    store: Arc<S>,
    buffer: Arc<IngestionBuffer>,
    policy: WritePolicy,
    last_committed: HashMap<String, DateTime<Utc>>,
    pending_events: VecDeque<Event>,
    buffer_rejections_seen: u64,
    stats: Arc<WriterStats>,
    notifications: NotificationSender,
}

impl<S: ReadingStore> std::fmt::Debug for BatchWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("policy", &self.policy)
            .field("devices", &self.last_committed.len())
            .field("pending_events", &self.pending_events.len())
            .finish_non_exhaustive()
    }
}

impl<S: ReadingStore> BatchWriter<S> {
    /// Create a writer, seeding the per-device high-water marks from the store.
    pub async fn new(
        store: Arc<S>,
        buffer: Arc<IngestionBuffer>,
        policy: WritePolicy,
        notifications: NotificationSender,
    ) -> Self {
        let last_committed = match store.last_timestamps().await {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load last committed timestamps");
                HashMap::new()
            }
        };
        Self {
            store,
            buffer,
            policy,
            last_committed,
            pending_events: VecDeque::new(),
            buffer_rejections_seen: 0,
            stats: Arc::new(WriterStats::default()),
            notifications,
        }
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the writer task.
    pub fn spawn(self, channel_capacity: usize) -> (JoinHandle<()>, WriterHandle) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let handle = WriterHandle {
            tx,
            stats: self.stats(),
        };
        let join = tokio::spawn(self.run(rx));
        (join, handle)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>) {
        tracing::info!(
            flush_interval = ?self.policy.flush_interval,
            max_attempts = self.policy.max_attempts,
            "Batch writer started"
        );

        let mut flush_tick = tokio::time::interval(self.policy.flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_tick.reset();
        let mut retention_tick = self.policy.retention.map(|_| {
            let mut tick = tokio::time::interval(RETENTION_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });
        let buffer = Arc::clone(&self.buffer);

        loop {
            tokio::select! {
                _ = flush_tick.tick() => {
                    self.flush().await;
                }
                _ = buffer.flush_requested() => {
                    tracing::debug!(queued = buffer.len(), "Flush requested by buffer");
                    self.flush().await;
                    flush_tick.reset();
                }
                command = rx.recv() => match command {
                    Some(WriterCommand::Flush(reply)) => {
                        let report = self.flush().await;
                        let _ = reply.send(report);
                    }
                    Some(WriterCommand::RecordEvent(event)) => self.record_event(event),
                    Some(WriterCommand::Shutdown(reply)) => {
                        tracing::info!("Batch writer shutting down");
                        let report = self.flush().await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        tracing::warn!("Command channel closed, shutting down");
                        self.flush().await;
                        break;
                    }
                },
                _ = next_tick(&mut retention_tick) => self.apply_retention().await,
            }
        }

        tracing::info!("Batch writer stopped");
    }

    /// Queue a system event; it is persisted after the next successful write.
    pub fn record_event(&mut self, event: Event) {
        if self.pending_events.len() >= MAX_PENDING_EVENTS {
            self.pending_events.pop_front();
        }
        self.pending_events.push_back(event);
    }

    /// Drain the buffer and write everything queued.
    pub async fn flush(&mut self) -> FlushReport {
        self.account_buffer_rejections();

        let entries = self.buffer.drain();
        let mut report = FlushReport::default();
        let mut failed = false;

        if !entries.is_empty() {
            let mut groups: BTreeMap<DeviceClass, Vec<Reading>> = BTreeMap::new();
            for entry in entries {
                groups.entry(entry.class).or_default().push(entry.reading);
            }

            for (class, readings) in groups {
                let group = self.write_group(class, readings).await;
                failed |= group.dropped > 0;
                report.absorb(group);
            }

            self.stats.record(&report);
            tracing::debug!(
                committed = report.committed,
                skipped = report.skipped,
                dropped = report.dropped,
                "Flush complete"
            );
        }

        if !failed {
            self.persist_events().await;
        }
        report
    }

    async fn write_group(&mut self, class: DeviceClass, readings: Vec<Reading>) -> FlushReport {
        let (fresh, stale) = self.take_fresh(readings);
        let mut report = FlushReport {
            skipped: stale,
            ..FlushReport::default()
        };
        if fresh.is_empty() {
            return report;
        }

        match self.write_with_retry(class, &fresh).await {
            Ok(inserted) => {
                report.committed = inserted;
                report.skipped += (fresh.len() as u64).saturating_sub(inserted);
                for reading in &fresh {
                    self.last_committed
                        .insert(reading.device_id.clone(), reading.timestamp);
                }
            }
            Err((attempts, e)) => {
                report.dropped = fresh.len() as u64;
                self.report_data_loss(class, &fresh, attempts, &e);
            }
        }
        report
    }

    /// Drop rows not newer than the device's last committed or queued row.
    fn take_fresh(&self, readings: Vec<Reading>) -> (Vec<Reading>, u64) {
        let mut newest: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut stale = 0;
        let fresh: Vec<Reading> = readings
            .into_iter()
            .filter(|r| {
                let floor = newest
                    .get(&r.device_id)
                    .or_else(|| self.last_committed.get(&r.device_id));
                if floor.is_some_and(|t| r.timestamp <= *t) {
                    tracing::debug!(device = %r.device_id, ts = %r.timestamp, "Stale reading skipped");
                    stale += 1;
                    return false;
                }
                newest.insert(r.device_id.clone(), r.timestamp);
                true
            })
            .collect();
        (fresh, stale)
    }

    async fn write_with_retry(
        &self,
        class: DeviceClass,
        readings: &[Reading],
    ) -> Result<u64, (u32, StorageError)> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.insert_batch(class, readings).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempt >= max_attempts => return Err((attempt, e)),
                Err(e) => {
                    let delay = self.policy.backoff.delay(attempt - 1);
                    tracing::warn!(
                        table = class.table(),
                        rows = readings.len(),
                        attempt,
                        max_attempts,
                        retry_in = ?delay,
                        error = %e,
                        "Batch write failed, retrying"
                    );
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn report_data_loss(
        &mut self,
        class: DeviceClass,
        readings: &[Reading],
        attempts: u32,
        error: &StorageError,
    ) {
        let mut devices: Vec<String> = readings.iter().map(|r| r.device_id.clone()).collect();
        devices.sort();
        devices.dedup();

        tracing::error!(
            table = class.table(),
            rows = readings.len(),
            attempts,
            devices = ?devices,
            error = %error,
            "Batch dropped after exhausting write attempts"
        );

        let loss = DataLoss {
            class,
            rows: readings.len(),
            devices,
            attempts,
            error: error.to_string(),
        };
        self.record_event(
            Event::new(
                EVENT_SOURCE,
                EventKind::DataLoss,
                EventSeverity::Critical,
                format!(
                    "{} {} readings dropped after {} write attempts",
                    loss.rows, class, attempts
                ),
            )
            .with_payload(json!({
                "table": class.table(),
                "rows": loss.rows,
                "devices": loss.devices,
                "first_ts": readings.first().map(|r| r.timestamp),
                "last_ts": readings.last().map(|r| r.timestamp),
                "error": loss.error,
            })),
        );
        publish(&self.notifications, Notification::DataLoss(loss));
    }

    /// Turn pushes refused by a full buffer into a data-loss event.
    fn account_buffer_rejections(&mut self) {
        let total = self.buffer.rejected();
        let new = total.saturating_sub(self.buffer_rejections_seen);
        if new == 0 {
            return;
        }
        self.buffer_rejections_seen = total;
        self.stats.rows_dropped.fetch_add(new, Ordering::Relaxed);
        self.record_event(
            Event::new(
                EVENT_SOURCE,
                EventKind::DataLoss,
                EventSeverity::Error,
                format!("{new} readings refused by a full ingestion buffer"),
            )
            .with_payload(json!({ "rows": new, "capacity": self.buffer.capacity() })),
        );
    }

    async fn persist_events(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let events: Vec<Event> = self.pending_events.iter().cloned().collect();
        match self.store.insert_events(&events).await {
            Ok(()) => self.pending_events.clear(),
            Err(e) => {
                tracing::warn!(error = %e, count = events.len(), "Event persist failed, keeping for next flush");
            }
        }
    }

    async fn apply_retention(&self) {
        let Some(retention) = self.policy.retention else {
            return;
        };
        let Ok(age) = chrono::Duration::from_std(retention) else {
            tracing::warn!(?retention, "Retention period out of range, skipping cleanup");
            return;
        };
        let cutoff = Utc::now() - age;
        match self.store.delete_before(cutoff).await {
            Ok(deleted) => tracing::info!(deleted, %cutoff, "Retention cleanup done"),
            Err(e) => tracing::error!(error = %e, "Retention cleanup failed"),
        }
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running writer.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
    stats: Arc<WriterStats>,
}

impl WriterHandle {
    pub async fn flush(&self) -> Result<FlushReport, WriterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(reply))
            .await
            .map_err(|_| WriterError::Closed)?;
        rx.await.map_err(|_| WriterError::Closed)
    }

    pub async fn record_event(&self, event: Event) -> Result<(), WriterError> {
        self.tx
            .send(WriterCommand::RecordEvent(event))
            .await
            .map_err(|_| WriterError::Closed)
    }

    /// Queue an event without waiting; fails if the channel is full or closed.
    pub fn try_record_event(&self, event: Event) -> Result<(), WriterError> {
        self.tx
            .try_send(WriterCommand::RecordEvent(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WriterError::Full,
                mpsc::error::TrySendError::Closed(_) => WriterError::Closed,
            })
    }

    /// Final flush; the task exits afterwards.
    pub async fn shutdown(&self) -> Result<FlushReport, WriterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Shutdown(reply))
            .await
            .map_err(|_| WriterError::Closed)?;
        rx.await.map_err(|_| WriterError::Closed)
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }
}
