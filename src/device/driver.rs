//! Driver contract, raw samples and register decoding.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::device::descriptor::{
    DeviceDescriptor, Encoding, Endpoint, Field, FieldSpec, RegisterMap, WordOrder,
};

/// Failure to open a connection to a gateway.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: Endpoint, timeout: Duration },

    #[error("connect to {endpoint} failed: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
}

/// Failure during a register read.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("not connected to {0}")]
    NotConnected(Endpoint),

    #[error("reading {field} timed out after {timeout:?}")]
    Timeout { field: Field, timeout: Duration },

    #[error("i/o error reading {field}: {source}")]
    Io {
        field: Field,
        #[source]
        source: std::io::Error,
    },

    /// Well-formed Modbus exception response from the slave.
    #[error("protocol error reading {field}: {message}")]
    Protocol { field: Field, message: String },

    /// Garbled or misaligned response; bytes left in the stream are unusable.
    #[error("framing error reading {field}: {message}")]
    Framing { field: Field, message: String },
}

impl ReadError {
    /// Whether the connection should be dropped before the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected(_) | Self::Timeout { .. } | Self::Io { .. } | Self::Framing { .. }
        )
    }
}

/// Raw words could not be turned into a value.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("sample has no words for {0}")]
    MissingField(Field),

    #[error("{field}: expected {expected} registers, got {actual}")]
    WordCount {
        field: Field,
        expected: usize,
        actual: usize,
    },

    #[error("{field}: decoded value is not finite")]
    NonFinite { field: Field },
}

/// Registers read for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWords {
    pub field: Field,
    pub words: Vec<u16>,
}

/// Undecoded result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub device_id: String,
    /// Taken when the poll started, before the first request.
    pub timestamp: DateTime<Utc>,
    pub words: Vec<FieldWords>,
}

impl RawSample {
    fn words_for(&self, field: Field) -> Option<&[u16]> {
        self.words
            .iter()
            .find(|w| w.field == field)
            .map(|w| w.words.as_slice())
    }
}

/// Scaled engineering values of one poll, not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<Field, f64>,
}

impl DecodedSample {
    pub fn get(&self, field: Field) -> Option<f64> {
        self.values.get(&field).copied()
    }
}

/// Current time truncated to the microsecond resolution of storage.
pub(crate) fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Protocol client for one device.
///
/// Implementations must tolerate `connect` after any failure and
/// `close` in any state.
#[async_trait::async_trait]
pub trait Driver: Send + 'static {
    /// Open every connection the register map needs. No-op when connected.
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Read every field of `map`. Fails as a whole if any field fails.
    async fn read(&mut self, map: &RegisterMap) -> Result<RawSample, ReadError>;

    /// Drop all connections.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Builds one driver per device. Closures work too.
pub trait DriverFactory: Send + Sync + 'static {
    fn create(&self, descriptor: &DeviceDescriptor) -> Box<dyn Driver>;
}

impl<F> DriverFactory for F
where
    F: Fn(&DeviceDescriptor) -> Box<dyn Driver> + Send + Sync + 'static,
{
    fn create(&self, descriptor: &DeviceDescriptor) -> Box<dyn Driver> {
        self(descriptor)
    }
}

/// Combine the words of one field into its raw integer value.
fn raw_value(spec: &FieldSpec, words: &[u16]) -> Result<f64, DecodeError> {
    let expected = usize::from(spec.encoding.word_count());
    if words.len() != expected {
        return Err(DecodeError::WordCount {
            field: spec.field,
            expected,
            actual: words.len(),
        });
    }

    let combined = || {
        let (hi, lo) = match spec.word_order {
            WordOrder::HighFirst => (words[0], words[1]),
            WordOrder::LowFirst => (words[1], words[0]),
        };
        (u32::from(hi) << 16) | u32::from(lo)
    };

    Ok(match spec.encoding {
        Encoding::I16 => f64::from(words[0] as i16),
        Encoding::U16 => f64::from(words[0]),
        Encoding::I32 => f64::from(combined() as i32),
        Encoding::U32 => f64::from(combined()),
    })
}

/// Apply a scale factor. Decimal scales divide so 197 x 0.1 gives 19.7 exactly.
fn apply_scale(raw: f64, scale: f64) -> f64 {
    if scale > 0.0 && scale < 1.0 {
        let divisor = (1.0 / scale).round();
        if (1.0 / divisor - scale).abs() < f64::EPSILON {
            return raw / divisor;
        }
    }
    raw * scale
}

/// Decode a raw sample according to its register map.
pub fn decode(map: &RegisterMap, sample: &RawSample) -> Result<DecodedSample, DecodeError> {
    let mut values = BTreeMap::new();
    for spec in map.fields() {
        let words = sample
            .words_for(spec.field)
            .ok_or(DecodeError::MissingField(spec.field))?;
        let value = apply_scale(raw_value(spec, words)?, spec.scale);
        if !value.is_finite() {
            return Err(DecodeError::NonFinite { field: spec.field });
        }
        values.insert(spec.field, value);
    }

    Ok(DecodedSample {
        device_id: sample.device_id.clone(),
        timestamp: sample.timestamp,
        values,
    })
}
