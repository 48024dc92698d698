//! Device supervisor.
//!
//! Owns the configured devices, their pollers and the batch writer. Everything
//! the UI layer needs (health, latest values, live notifications) is read from
//! here without touching poller state directly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::device::{DeviceDescriptor, DriverFactory};
use crate::ingest::{
    BatchWriter, DEFAULT_CAPACITY, FlushReport, IngestionBuffer, WritePolicy, WriterError,
    WriterHandle, WriterStatsSnapshot,
};
use crate::notification::{NOTIFICATION_CAPACITY, Notification, NotificationSender};
use crate::poller::{DeviceHealth, Poller, PollerCommand, PollerSettings, PollerWatch};
use crate::storage::{DeviceClass, Event, EventKind, EventSeverity, Reading, ReadingStore};

/// Default time a poller gets to stop before it is aborted.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Default spacing between device start-ups.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(200);

const EVENT_SOURCE: &str = "supervisor";
const WRITER_CHANNEL_CAPACITY: usize = 64;
const POLLER_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("device id '{0}' configured more than once")]
    DuplicateDevice(String),

    #[error("device '{0}' has no energy counter")]
    NoEnergyCounter(String),

    #[error("device '{0}' is not being polled")]
    DeviceStopped(String),

    #[error("supervisor already running")]
    AlreadyRunning,

    #[error("supervisor not running")]
    NotRunning,

    #[error(transparent)]
    Writer(#[from] WriterError),
}

/// Tunables for pollers, buffer and writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub poller: PollerSettings,
    pub write: WritePolicy,
    pub buffer_capacity: usize,
    /// Delay between consecutive device start-ups.
    pub stagger: Duration,
    /// How long a stopping poller may take before it is aborted.
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poller: PollerSettings::default(),
            write: WritePolicy::default(),
            buffer_capacity: DEFAULT_CAPACITY,
            stagger: DEFAULT_STAGGER,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

struct PollerHandle {
    stop: watch::Sender<bool>,
    commands: mpsc::Sender<PollerCommand>,
    join: JoinHandle<()>,
}

/// Registry of devices and their live pollers.
pub struct Supervisor<S: ReadingStore> {
    descriptors: Vec<Arc<DeviceDescriptor>>,
    settings: SupervisorSettings,
    store: Arc<S>,
    factory: Arc<dyn DriverFactory>,
    buffer: Arc<IngestionBuffer>,
    notifications: NotificationSender,
    pollers: HashMap<String, PollerHandle>,
    watches: HashMap<String, PollerWatch>,
    writer: Option<WriterHandle>,
    writer_join: Option<JoinHandle<()>>,
}

impl<S: ReadingStore> std::fmt::Debug for Supervisor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("devices", &self.descriptors.len())
            .field("running_pollers", &self.pollers.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<S: ReadingStore> Supervisor<S> {
    /// Create a supervisor for `descriptors`. Device ids must be unique.
    pub fn new(
        descriptors: Vec<DeviceDescriptor>,
        store: Arc<S>,
        factory: Arc<dyn DriverFactory>,
        settings: SupervisorSettings,
    ) -> Result<Self, SupervisorError> {
        let mut seen = HashSet::new();
        for d in &descriptors {
            if !seen.insert(d.id.as_str()) {
                return Err(SupervisorError::DuplicateDevice(d.id.clone()));
            }
        }

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            descriptors: descriptors.into_iter().map(Arc::new).collect(),
            buffer: Arc::new(IngestionBuffer::new(settings.buffer_capacity)),
            settings,
            store,
            factory,
            notifications,
            pollers: HashMap::new(),
            watches: HashMap::new(),
            writer: None,
            writer_join: None,
        })
    }

    /// Start the writer, then one poller per device with staggered first ticks.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let writer = BatchWriter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.buffer),
            self.settings.write,
            self.notifications.clone(),
        )
        .await;
        let (join, handle) = writer.spawn(WRITER_CHANNEL_CAPACITY);
        self.writer = Some(handle);
        self.writer_join = Some(join);

        let mut persisted = match self.store.last_readings().await {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load last persisted readings");
                HashMap::new()
            }
        };

        let descriptors = self.descriptors.clone();
        for (i, descriptor) in descriptors.iter().enumerate() {
            let delay = self
                .settings
                .stagger
                .saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
            let stored = persisted
                .remove(&descriptor.id)
                .filter(|r| r.class() == descriptor.class);
            let last = newest(self.last_reading(&descriptor.id), stored);
            if let Some(r) = &last {
                tracing::debug!(device = %descriptor.id, ts = %r.timestamp, energy = ?r.energy(), "Resuming from last reading");
            }
            self.spawn_poller(descriptor, delay, last);
        }

        self.emit(
            EventKind::System,
            EventSeverity::Info,
            "Supervisor started",
            json!({ "devices": self.descriptors.len() }),
        );
        tracing::info!(devices = self.descriptors.len(), "Supervisor started");
        Ok(())
    }

    /// Stop every poller, force a final flush, then stop the writer.
    pub async fn stop(&mut self) -> Result<FlushReport, SupervisorError> {
        let (Some(writer), Some(writer_join)) = (self.writer.clone(), self.writer_join.take())
        else {
            return Err(SupervisorError::NotRunning);
        };

        let pollers: Vec<_> = self.pollers.drain().collect();
        for (_, handle) in &pollers {
            let _ = handle.stop.send(true);
        }
        let mut aborted = 0;
        for (id, handle) in pollers {
            if !join_within(&id, handle.join, self.settings.stop_grace).await {
                aborted += 1;
            }
        }

        self.emit(
            EventKind::System,
            EventSeverity::Info,
            "Supervisor stopped",
            json!({ "devices": self.descriptors.len(), "aborted_pollers": aborted }),
        );
        let report = writer.shutdown().await?;
        if let Err(e) = writer_join.await {
            tracing::error!(error = %e, "Batch writer task failed");
        }

        tracing::info!(
            committed = report.committed,
            dropped = report.dropped,
            aborted_pollers = aborted,
            "Supervisor stopped"
        );
        Ok(report)
    }

    /// Stop polling one device. Its last health and reading stay readable.
    pub async fn stop_device(&mut self, device_id: &str) -> Result<(), SupervisorError> {
        self.descriptor(device_id)?;
        let Some(handle) = self.pollers.remove(device_id) else {
            return Ok(());
        };

        let _ = handle.stop.send(true);
        join_within(device_id, handle.join, self.settings.stop_grace).await;
        self.emit(
            EventKind::Device,
            EventSeverity::Info,
            format!("Device '{device_id}' stopped"),
            json!({ "device": device_id }),
        );
        tracing::info!(device = %device_id, "Device stopped");
        Ok(())
    }

    /// Stop the device's poller if running and start a fresh one with a new driver.
    pub async fn restart_device(&mut self, device_id: &str) -> Result<(), SupervisorError> {
        let descriptor = self.descriptor(device_id)?;
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }

        if let Some(handle) = self.pollers.remove(device_id) {
            let _ = handle.stop.send(true);
            join_within(device_id, handle.join, self.settings.stop_grace).await;
        }
        let last = self.last_reading(device_id);
        self.spawn_poller(&descriptor, Duration::ZERO, last);

        self.emit(
            EventKind::Device,
            EventSeverity::Info,
            format!("Device '{device_id}' restarted"),
            json!({ "device": device_id }),
        );
        tracing::info!(device = %device_id, "Device restarted");
        Ok(())
    }

    /// Let the device's next energy counter regression through as a meter reset.
    pub async fn acknowledge_meter_reset(&self, device_id: &str) -> Result<(), SupervisorError> {
        let descriptor = self.descriptor(device_id)?;
        if descriptor.class == DeviceClass::Groundpipe {
            return Err(SupervisorError::NoEnergyCounter(device_id.to_string()));
        }
        let handle = self
            .pollers
            .get(device_id)
            .ok_or_else(|| SupervisorError::DeviceStopped(device_id.to_string()))?;
        handle
            .commands
            .send(PollerCommand::AcknowledgeMeterReset)
            .await
            .map_err(|_| SupervisorError::DeviceStopped(device_id.to_string()))?;

        self.emit(
            EventKind::Device,
            EventSeverity::Warn,
            format!("Meter reset acknowledged for '{device_id}'"),
            json!({ "device": device_id }),
        );
        Ok(())
    }

    /// Health of every configured device, keyed by id.
    pub fn health_snapshot(&self) -> BTreeMap<String, DeviceHealth> {
        self.descriptors
            .iter()
            .map(|d| {
                let health = match self.watches.get(&d.id) {
                    Some(w) => w.health.borrow().clone(),
                    None => DeviceHealth::new(d.id.clone(), d.class),
                };
                (d.id.clone(), health)
            })
            .collect()
    }

    /// Most recent accepted reading of a device.
    pub fn latest_reading(&self, device_id: &str) -> Option<Reading> {
        self.last_reading(device_id)
    }

    /// Live readings, health changes and data-loss reports.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn writer_stats(&self) -> WriterStatsSnapshot {
        self.writer
            .as_ref()
            .map(WriterHandle::stats)
            .unwrap_or_default()
    }

    /// Flush the buffer now.
    pub async fn flush(&self) -> Result<FlushReport, SupervisorError> {
        match (&self.writer, &self.writer_join) {
            (Some(writer), Some(_)) => Ok(writer.flush().await?),
            _ => Err(SupervisorError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.writer_join.is_some()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.descriptors.iter().map(Arc::as_ref)
    }

    /// Readings queued and not yet drained by the writer.
    pub fn queued(&self) -> usize {
        self.buffer.len()
    }

    // --- Private helpers ---

    fn descriptor(&self, device_id: &str) -> Result<Arc<DeviceDescriptor>, SupervisorError> {
        self.descriptors
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownDevice(device_id.to_string()))
    }

    fn last_reading(&self, device_id: &str) -> Option<Reading> {
        self.watches
            .get(device_id)
            .and_then(|w| w.latest.borrow().clone())
    }

    fn spawn_poller(
        &mut self,
        descriptor: &Arc<DeviceDescriptor>,
        initial_delay: Duration,
        last: Option<Reading>,
    ) {
        let driver = self.factory.create(descriptor);
        let (poller, published) = Poller::new(
            Arc::clone(descriptor),
            driver,
            self.settings.poller,
            Arc::clone(&self.buffer),
            self.notifications.clone(),
        );
        let poller = poller.with_last_reading(last.as_ref());

        let (stop, stop_rx) = watch::channel(false);
        let (commands, commands_rx) = mpsc::channel(POLLER_CHANNEL_CAPACITY);
        let join = tokio::spawn(poller.run(initial_delay, stop_rx, commands_rx));

        self.pollers.insert(
            descriptor.id.clone(),
            PollerHandle {
                stop,
                commands,
                join,
            },
        );
        self.watches.insert(descriptor.id.clone(), published);
    }

    fn emit(
        &self,
        kind: EventKind,
        severity: EventSeverity,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) {
        let Some(writer) = &self.writer else {
            return;
        };
        let event = Event::new(EVENT_SOURCE, kind, severity, message).with_payload(payload);
        if let Err(e) = writer.try_record_event(event) {
            tracing::warn!(error = %e, "Failed to enqueue event");
        }
    }
}

/// The later of two readings.
fn newest(a: Option<Reading>, b: Option<Reading>) -> Option<Reading> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.timestamp > a.timestamp { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Wait for a stopping poller; abort it after `grace`. Returns whether it exited in time.
async fn join_within(device_id: &str, mut join: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut join).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(device = %device_id, error = %e, "Poller task failed");
            true
        }
        Err(_) => {
            tracing::warn!(device = %device_id, ?grace, "Poller did not stop in time, aborting");
            join.abort();
            false
        }
    }
}
