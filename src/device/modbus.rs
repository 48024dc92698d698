//! Modbus RTU over raw TCP.
//!
//! The field gateways bridge an RS-485 bus to a TCP socket and pass RTU frames
//! through untouched, so frames carry a CRC and no MBAP header. Framing and
//! response parsing use `rmodbus`; socket I/O is tokio with explicit timeouts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rmodbus::client::ModbusRequest;
use rmodbus::{ModbusProto, guess_response_frame_len};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::device::descriptor::{DeviceDescriptor, Endpoint, FieldSpec, RegisterMap};
use crate::device::driver::{
    ConnectError, Driver, DriverFactory, FieldWords, RawSample, ReadError, now_micros,
};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default per-transaction timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Unit id, function code and byte count (or exception code).
const RTU_HEADER_LEN: usize = 3;

/// Per-gateway locks serialising transactions on a shared half-duplex bus.
#[derive(Debug, Clone, Default)]
pub struct BusLocks {
    inner: Arc<Mutex<HashMap<Endpoint, Arc<tokio::sync::Mutex<()>>>>>,
}

impl BusLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding `endpoint`, created on first use.
    pub fn lock_for(&self, endpoint: &Endpoint) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(endpoint.clone()).or_default())
    }
}

/// Driver for one device behind one or more RTU-over-TCP gateways.
pub struct ModbusRtuDriver {
    device_id: String,
    primary: Endpoint,
    endpoints: Vec<Endpoint>,
    connections: HashMap<Endpoint, TcpStream>,
    connect_timeout: Duration,
    io_timeout: Duration,
    bus: BusLocks,
}

impl std::fmt::Debug for ModbusRtuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusRtuDriver")
            .field("device_id", &self.device_id)
            .field("endpoints", &self.endpoints)
            .field("connected", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl ModbusRtuDriver {
    pub fn new(descriptor: &DeviceDescriptor, bus: BusLocks) -> Self {
        Self {
            device_id: descriptor.id.clone(),
            primary: descriptor.endpoint.clone(),
            endpoints: descriptor.register_map.endpoints(&descriptor.endpoint),
            connections: HashMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            bus,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

const READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus RTU CRC-16 (poly 0xA001, init 0xFFFF).
fn crc16(frame: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in frame {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Whether the trailing two bytes are the little-endian CRC of the rest.
fn crc_matches(frame: &[u8]) -> bool {
    match frame.split_last_chunk::<2>() {
        Some((body, crc)) => crc16(body) == u16::from_le_bytes(*crc),
        None => false,
    }
}

/// One read-holding-registers request/response exchange.
///
/// Only a CRC-valid exception reply is a [`ReadError::Protocol`]; anything that
/// leaves the stream in an unknown state is [`ReadError::Framing`].
async fn transact(stream: &mut TcpStream, spec: &FieldSpec) -> Result<Vec<u16>, ReadError> {
    let framing = |message: String| ReadError::Framing {
        field: spec.field,
        message,
    };
    let io = |source: std::io::Error| ReadError::Io {
        field: spec.field,
        source,
    };

    let mut mreq = ModbusRequest::new(spec.unit_id, ModbusProto::Rtu);
    let mut request = Vec::new();
    mreq.generate_get_holdings(spec.register, spec.encoding.word_count(), &mut request)
        .map_err(|e| ReadError::Protocol {
            field: spec.field,
            message: format!("cannot build request: {e:?}"),
        })?;
    stream.write_all(&request).await.map_err(io)?;

    let mut response = vec![0u8; RTU_HEADER_LEN];
    stream.read_exact(&mut response).await.map_err(io)?;
    if response[0] != spec.unit_id || response[1] & !EXCEPTION_FLAG != READ_HOLDING_REGISTERS {
        return Err(framing(format!(
            "unexpected header {:02X} {:02X} from unit {}",
            response[0], response[1], spec.unit_id
        )));
    }
    let frame_len = usize::from(
        guess_response_frame_len(&response, ModbusProto::Rtu)
            .map_err(|e| framing(format!("bad response header: {e:?}")))?,
    );
    if frame_len > RTU_HEADER_LEN {
        let mut rest = vec![0u8; frame_len - RTU_HEADER_LEN];
        stream.read_exact(&mut rest).await.map_err(io)?;
        response.extend_from_slice(&rest);
    }
    if !crc_matches(&response) {
        return Err(framing("CRC mismatch".to_string()));
    }

    if response[1] & EXCEPTION_FLAG != 0 {
        return Err(ReadError::Protocol {
            field: spec.field,
            message: format!("exception code 0x{:02X}", response[2]),
        });
    }

    let mut words = Vec::new();
    mreq.parse_u16(&response, &mut words)
        .map_err(|e| framing(format!("{e:?}")))?;
    Ok(words)
}

#[async_trait::async_trait]
impl Driver for ModbusRtuDriver {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        for endpoint in &self.endpoints {
            if self.connections.contains_key(endpoint) {
                continue;
            }
            let attempt = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
            let stream = match timeout(self.connect_timeout, attempt).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(ConnectError::Io {
                        endpoint: endpoint.clone(),
                        source,
                    });
                }
                Err(_) => {
                    return Err(ConnectError::Timeout {
                        endpoint: endpoint.clone(),
                        timeout: self.connect_timeout,
                    });
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(endpoint = %endpoint, error = %e, "Failed to set TCP_NODELAY");
            }
            tracing::debug!(device = %self.device_id, endpoint = %endpoint, "Connected");
            self.connections.insert(endpoint.clone(), stream);
        }
        Ok(())
    }

    async fn read(&mut self, map: &RegisterMap) -> Result<RawSample, ReadError> {
        let timestamp = now_micros();
        let mut words = Vec::with_capacity(map.fields().len());

        for spec in map.fields() {
            let endpoint = spec
                .endpoint
                .clone()
                .unwrap_or_else(|| self.primary.clone());
            let bus = self.bus.lock_for(&endpoint);
            let _turn = bus.lock().await;

            let Some(stream) = self.connections.get_mut(&endpoint) else {
                return Err(ReadError::NotConnected(endpoint));
            };
            let result = match timeout(self.io_timeout, transact(stream, spec)).await {
                Ok(result) => result,
                Err(_) => Err(ReadError::Timeout {
                    field: spec.field,
                    timeout: self.io_timeout,
                }),
            };

            match result {
                Ok(values) => words.push(FieldWords {
                    field: spec.field,
                    words: values,
                }),
                Err(e) => {
                    if e.is_transient() {
                        // A late reply would desync the next exchange.
                        self.connections.remove(&endpoint);
                    }
                    return Err(e);
                }
            }
        }

        Ok(RawSample {
            device_id: self.device_id.clone(),
            timestamp,
            words,
        })
    }

    async fn close(&mut self) {
        for (endpoint, mut stream) in self.connections.drain() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(endpoint = %endpoint, error = %e, "Socket shutdown failed");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.endpoints
            .iter()
            .all(|e| self.connections.contains_key(e))
    }
}

/// Builds [`ModbusRtuDriver`]s sharing one set of bus locks.
#[derive(Debug, Clone)]
pub struct ModbusDriverFactory {
    bus: BusLocks,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ModbusDriverFactory {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            bus: BusLocks::new(),
            connect_timeout,
            io_timeout,
        }
    }
}

impl DriverFactory for ModbusDriverFactory {
    fn create(&self, descriptor: &DeviceDescriptor) -> Box<dyn Driver> {
        Box::new(
            ModbusRtuDriver::new(descriptor, self.bus.clone())
                .with_connect_timeout(self.connect_timeout)
                .with_io_timeout(self.io_timeout),
        )
    }
}
