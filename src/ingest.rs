//! Ingestion
//!
//! Decouples acquisition from storage:
//!
//! - [`IngestionBuffer`]: Concurrent FIFO queue fed by every poller
//! - [`BatchWriter`]: Single writer task, one transactional batch per device class per flush

mod buffer;
mod writer;

pub use buffer::{BufferEntry, DEFAULT_CAPACITY, IngestionBuffer, PushOutcome};
pub use writer::{
    BatchWriter, FlushReport, WritePolicy, WriterCommand, WriterError, WriterHandle, WriterStats,
    WriterStatsSnapshot,
};
