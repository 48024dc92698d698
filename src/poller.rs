//! Device Pollers
//!
//! One task per device, each on its own timer. A poller is the only writer of
//! its device's health; the supervisor reads it through watch channels.
//!
//! - [`Poller`]: Connect, read, decode, normalize and queue, with backoff on failure
//! - [`Backoff`]: Capped exponential delay, also used by the batch writer
//! - [`DeviceHealth`]: Published health snapshot

mod backoff;
mod health;
mod task;

pub use backoff::Backoff;
pub use health::{DeviceHealth, HealthState};
pub use task::{PollError, Poller, PollerCommand, PollerSettings, PollerWatch};
