//! Polling loop for one device.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::device::{ConnectError, DecodeError, DeviceDescriptor, Driver, ReadError, decode};
use crate::ingest::{BufferEntry, IngestionBuffer, PushOutcome};
use crate::normalize::{Baseline, normalize};
use crate::notification::{DataLoss, Notification, NotificationSender, publish};
use crate::poller::backoff::Backoff;
use crate::poller::health::{DeviceHealth, HealthState};
use crate::storage::Reading;

// =============================================================================
// Settings & Commands
// =============================================================================

/// Retry behaviour shared by all pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub backoff: Backoff,
    /// Consecutive failures before the device is reported as degraded.
    pub degraded_after: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            degraded_after: 1,
        }
    }
}

/// Requests from the supervisor to a running poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerCommand {
    /// Accept the next energy counter regression as a meter reset.
    AcknowledgeMeterReset,
}

/// Why a tick failed.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Read side of a poller's published state.
#[derive(Debug, Clone)]
pub struct PollerWatch {
    pub health: watch::Receiver<DeviceHealth>,
    pub latest: watch::Receiver<Option<Reading>>,
}

// =============================================================================
// Poller
// =============================================================================

/// Owns one driver and the device's health.
///
/// Nothing else writes the health or latest reading; both are published
/// through watch channels after every change.
pub struct Poller {
    descriptor: Arc<DeviceDescriptor>,
    driver: Box<dyn Driver>,
    settings: PollerSettings,
    buffer: Arc<IngestionBuffer>,
    health: DeviceHealth,
    health_tx: watch::Sender<DeviceHealth>,
    latest_tx: watch::Sender<Option<Reading>>,
    notifications: NotificationSender,
    baseline: Option<Baseline>,
    reset_pending: bool,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("device", &self.descriptor.id)
            .field("state", &self.health.state)
            .field("reset_pending", &self.reset_pending)
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub fn new(
        descriptor: Arc<DeviceDescriptor>,
        driver: Box<dyn Driver>,
        settings: PollerSettings,
        buffer: Arc<IngestionBuffer>,
        notifications: NotificationSender,
    ) -> (Self, PollerWatch) {
        let health = DeviceHealth::new(descriptor.id.clone(), descriptor.class);
        let (health_tx, health_rx) = watch::channel(health.clone());
        let (latest_tx, latest_rx) = watch::channel(None);

        let poller = Self {
            descriptor,
            driver,
            settings,
            buffer,
            health,
            health_tx,
            latest_tx,
            notifications,
            baseline: None,
            reset_pending: false,
        };
        let watch = PollerWatch {
            health: health_rx,
            latest: latest_rx,
        };
        (poller, watch)
    }

    /// Continue from a previously accepted reading, e.g. after a restart.
    pub fn with_last_reading(mut self, reading: Option<&Reading>) -> Self {
        if let Some(reading) = reading {
            self.baseline = Some(Baseline::of(reading));
            self.latest_tx.send_replace(Some(reading.clone()));
        }
        self
    }

    pub fn health(&self) -> &DeviceHealth {
        &self.health
    }

    pub fn device_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn handle_command(&mut self, command: PollerCommand) {
        match command {
            PollerCommand::AcknowledgeMeterReset => {
                tracing::info!(device = %self.descriptor.id, "Meter reset acknowledged");
                self.reset_pending = true;
            }
        }
    }

    /// Run until `stop` flips or its sender goes away.
    ///
    /// An in-flight tick is abandoned on stop; the driver is closed either way.
    pub async fn run(
        mut self,
        initial_delay: Duration,
        mut stop: watch::Receiver<bool>,
        mut commands: mpsc::Receiver<PollerCommand>,
    ) {
        tracing::debug!(device = %self.descriptor.id, ?initial_delay, "Poller started");
        let mut next = Instant::now() + initial_delay;

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        self.handle_command(command);
                        continue;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next) => {}
            }

            let started = Instant::now();
            let delay = tokio::select! {
                biased;
                _ = stop.changed() => {
                    tracing::debug!(device = %self.descriptor.id, "In-flight poll abandoned");
                    break;
                }
                delay = self.tick() => delay,
            };
            next = started + delay;
        }

        self.shutdown().await;
    }

    /// Poll once and return the delay until the next tick.
    pub async fn tick(&mut self) -> Duration {
        match self.poll_once().await {
            Ok(()) => self.descriptor.poll_interval,
            Err(e) => self.on_failure(e),
        }
    }

    async fn poll_once(&mut self) -> Result<(), PollError> {
        if !self.driver.is_connected() {
            if self.health.consecutive_failures == 0 {
                self.set_state(HealthState::Connecting);
            }
            self.driver.connect().await?;
            tracing::info!(device = %self.descriptor.id, endpoint = %self.descriptor.endpoint, "Connected");
        }

        let raw = match self.driver.read(&self.descriptor.register_map).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.is_transient() {
                    self.driver.close().await;
                }
                return Err(e.into());
            }
        };
        let sample = decode(&self.descriptor.register_map, &raw)?;

        self.health.consecutive_failures = 0;
        self.health.last_success = Some(sample.timestamp);
        self.health.retry_in = None;
        self.set_state(HealthState::Healthy);

        match normalize(
            self.descriptor.class,
            &sample,
            self.baseline.as_ref(),
            self.reset_pending,
        ) {
            Ok(reading) => self.accept(reading),
            Err(e) => {
                self.health.rejected += 1;
                self.health_tx.send_replace(self.health.clone());
                tracing::warn!(device = %self.descriptor.id, error = %e, "Reading rejected");
                publish(
                    &self.notifications,
                    Notification::Rejected {
                        device_id: self.descriptor.id.clone(),
                        reason: e.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn accept(&mut self, reading: Reading) {
        let outcome = self.buffer.push(BufferEntry::from(reading.clone()));
        if outcome == PushOutcome::Rejected {
            tracing::error!(
                device = %self.descriptor.id,
                queued = self.buffer.len(),
                "Ingestion buffer full, reading dropped"
            );
            publish(
                &self.notifications,
                Notification::DataLoss(DataLoss {
                    class: self.descriptor.class,
                    rows: 1,
                    devices: vec![self.descriptor.id.clone()],
                    attempts: 0,
                    error: "ingestion buffer full".to_string(),
                }),
            );
            return;
        }

        if reading.meter_reset() {
            tracing::info!(device = %self.descriptor.id, energy = ?reading.energy(), "Meter reset recorded");
            self.reset_pending = false;
        }
        tracing::debug!(device = %self.descriptor.id, ts = %reading.timestamp, "Reading queued");

        self.baseline = Some(Baseline::of(&reading));
        self.health.accepted += 1;
        self.health_tx.send_replace(self.health.clone());
        self.latest_tx.send_replace(Some(reading.clone()));
        publish(&self.notifications, Notification::Reading(reading));
    }

    fn on_failure(&mut self, error: PollError) -> Duration {
        let failures = self.health.consecutive_failures.saturating_add(1);
        let delay = self.settings.backoff.delay(failures);

        self.health.consecutive_failures = failures;
        self.health.last_error = Some(error.to_string());
        self.health.retry_in = Some(delay);
        let state = if failures >= self.settings.degraded_after {
            HealthState::Degraded {
                consecutive_failures: failures,
            }
        } else {
            HealthState::Disconnected
        };
        self.set_state(state);

        tracing::warn!(
            device = %self.descriptor.id,
            failures,
            retry_in = ?delay,
            error = %error,
            "Poll failed"
        );
        delay
    }

    async fn shutdown(&mut self) {
        self.driver.close().await;
        self.health.retry_in = None;
        self.set_state(HealthState::Stopped);
        tracing::info!(device = %self.descriptor.id, "Poller stopped");
    }

    /// Publish the current health; broadcast only actual state changes.
    fn set_state(&mut self, state: HealthState) {
        let changed = self.health.state != state;
        self.health.state = state;
        self.health_tx.send_replace(self.health.clone());
        if changed {
            publish(&self.notifications, Notification::Health(self.health.clone()));
        }
    }
}
