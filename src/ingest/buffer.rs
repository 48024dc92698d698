//! Ingestion buffer shared by all pollers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::storage::{DeviceClass, Reading};

/// Default number of queued entries before a flush is forced.
pub const DEFAULT_CAPACITY: usize = 500;

/// One queued reading.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub class: DeviceClass,
    pub reading: Reading,
}

impl From<Reading> for BufferEntry {
    fn from(reading: Reading) -> Self {
        Self {
            class: reading.class(),
            reading,
        }
    }
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued below capacity.
    Queued,
    /// Queued at or above capacity; the writer was asked to flush.
    FlushRequested,
    /// Hard limit reached; the entry was not queued.
    Rejected,
}

/// FIFO queue between the pollers and the batch writer.
///
/// Pushing never waits. Reaching `capacity` wakes the writer out of band; the
/// entry is still accepted up to twice the capacity, after which pushes are
/// refused and counted so the loss is visible.
#[derive(Debug)]
pub struct IngestionBuffer {
    capacity: usize,
    hard_limit: usize,
    queue: Mutex<VecDeque<BufferEntry>>,
    flush: Notify,
    rejected: AtomicU64,
}

impl IngestionBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            hard_limit: capacity.saturating_mul(2),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            flush: Notify::new(),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn push(&self, entry: BufferEntry) -> PushOutcome {
        let len = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.hard_limit {
                drop(queue);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.flush.notify_one();
                return PushOutcome::Rejected;
            }
            queue.push_back(entry);
            queue.len()
        };

        if len >= self.capacity {
            self.flush.notify_one();
            PushOutcome::FlushRequested
        } else {
            PushOutcome::Queued
        }
    }

    /// Take everything queued, oldest first.
    pub fn drain(&self) -> Vec<BufferEntry> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain(..).collect()
    }

    /// Resolves once a push asked for a flush. Requests made while nobody
    /// waits are kept, so none is lost.
    pub async fn flush_requested(&self) {
        self.flush.notified().await;
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries refused at the hard limit since startup.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Default for IngestionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
