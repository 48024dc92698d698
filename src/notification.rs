//! Live notifications broadcast to subscribers of the supervisor.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::poller::DeviceHealth;
use crate::storage::{DeviceClass, Reading};

/// Capacity of the notification channel. Slow subscribers see `Lagged`.
pub const NOTIFICATION_CAPACITY: usize = 256;

/// Rows that could not be persisted after every write attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataLoss {
    pub class: DeviceClass,
    pub rows: usize,
    pub devices: Vec<String>,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A reading was accepted and queued for storage.
    Reading(Reading),
    /// A device changed health state.
    Health(DeviceHealth),
    /// A sample was rejected before storage.
    Rejected { device_id: String, reason: String },
    DataLoss(DataLoss),
}

pub type NotificationSender = broadcast::Sender<Notification>;

/// Send, ignoring the case where nobody is subscribed.
pub(crate) fn publish(tx: &NotificationSender, notification: Notification) {
    let _ = tx.send(notification);
}
