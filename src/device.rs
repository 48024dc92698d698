//! Device Layer
//!
//! Everything that talks to field hardware:
//!
//! - [`DeviceDescriptor`] / [`RegisterMap`]: Static description of a device and its registers
//! - [`Driver`]: Protocol client contract, one instance per device
//! - [`decode`]: Word order, sign and scale applied to raw registers
//! - [`ModbusRtuDriver`]: Modbus RTU framed over raw TCP gateways

mod descriptor;
mod driver;
pub mod modbus;

pub use descriptor::{
    DeviceDescriptor, ENERGY_REGISTER, Encoding, Endpoint, FLOW_REGISTER, Field, FieldSpec,
    MeterRef, RegisterMap, SensorUnits, TEMPERATURE_REGISTER, WordOrder, allowed_fields,
    required_fields,
};
pub use driver::{
    ConnectError, DecodeError, DecodedSample, Driver, DriverFactory, FieldWords, RawSample,
    ReadError, decode,
};
pub use modbus::{BusLocks, ModbusDriverFactory, ModbusRtuDriver};
