//! Per-device health as published by its poller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::DeviceClass;

/// Connectivity state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthState {
    /// No connection, none being attempted right now.
    Disconnected,
    /// A connect is in flight.
    Connecting,
    /// Last poll succeeded.
    Healthy,
    /// Still retried at the backoff interval.
    Degraded { consecutive_failures: u32 },
    /// Stopped by the supervisor.
    Stopped,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Healthy => "healthy",
            Self::Degraded { .. } => "degraded",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Degraded {
                consecutive_failures,
            } => write!(f, "degraded ({consecutive_failures} failures)"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Snapshot of one device's health and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub class: DeviceClass,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Readings accepted by the normalizer and queued.
    pub accepted: u64,
    /// Samples rejected by decoding or validation.
    pub rejected: u64,
    /// Delay before the next attempt while backing off.
    #[serde(with = "humantime_serde")]
    pub retry_in: Option<Duration>,
}

impl DeviceHealth {
    pub fn new(device_id: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            device_id: device_id.into(),
            class,
            state: HealthState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            accepted: 0,
            rejected: 0,
            retry_in: None,
        }
    }
}
