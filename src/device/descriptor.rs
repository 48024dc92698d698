//! Static device description: identity, endpoint and register map.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::DeviceClass;

/// Holding register of the signed 0.1 °C temperature value.
pub const TEMPERATURE_REGISTER: u16 = 0x0001;
/// First holding register of the 32-bit flow counter (0.01 L/min).
pub const FLOW_REGISTER: u16 = 0x0022;
/// First holding register of the 32-bit cumulative energy counter (0.01 kWh).
pub const ENERGY_REGISTER: u16 = 0x0404;

/// TCP address of a Modbus gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Measured quantity a register maps to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Field {
    InputTemp,
    OutputTemp,
    Flow,
    /// Heat pump energy, read from its power meter.
    Energy,
    /// Power meter energy.
    TotalEnergy,
}

/// Register value encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    I16,
    U16,
    I32,
    U32,
}

impl Encoding {
    /// Number of 16-bit registers the value spans.
    pub fn word_count(&self) -> u16 {
        match self {
            Self::I16 | Self::U16 => 1,
            Self::I32 | Self::U32 => 2,
        }
    }
}

/// Order of the two registers of a 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// First register holds the most significant word.
    #[default]
    HighFirst,
    /// First register holds the least significant word.
    LowFirst,
}

/// Where and how one field is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: Field,
    /// Modbus slave id on the bus.
    pub unit_id: u8,
    /// First holding register.
    pub register: u16,
    pub encoding: Encoding,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Multiplier applied to the raw integer.
    pub scale: f64,
    /// Gateway to read from instead of the device's own endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
}

impl FieldSpec {
    fn temperature(field: Field, unit_id: u8) -> Self {
        Self {
            field,
            unit_id,
            register: TEMPERATURE_REGISTER,
            encoding: Encoding::I16,
            word_order: WordOrder::HighFirst,
            scale: 0.1,
            endpoint: None,
        }
    }

    fn flow(unit_id: u8) -> Self {
        Self {
            field: Field::Flow,
            unit_id,
            register: FLOW_REGISTER,
            encoding: Encoding::U32,
            word_order: WordOrder::LowFirst,
            scale: 0.01,
            endpoint: None,
        }
    }

    fn energy(field: Field, unit_id: u8, endpoint: Option<Endpoint>) -> Self {
        Self {
            field,
            unit_id,
            register: ENERGY_REGISTER,
            encoding: Encoding::U32,
            word_order: WordOrder::HighFirst,
            scale: 0.01,
            endpoint,
        }
    }
}

/// Slave ids of the sensors behind a heat pump or ground pipe gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorUnits {
    pub input_temp: u8,
    pub output_temp: u8,
    pub flow: u8,
}

impl Default for SensorUnits {
    fn default() -> Self {
        Self {
            input_temp: 1,
            output_temp: 2,
            flow: 3,
        }
    }
}

/// Power meter wired to a heat pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRef {
    pub endpoint: Endpoint,
    pub unit_id: u8,
}

/// Ordered list of fields to read on every poll.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterMap {
    fields: Vec<FieldSpec>,
}

impl RegisterMap {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Standard map for a device class.
    ///
    /// Heat pumps read energy from `meter` when given; power meters read
    /// energy from `unit_id` on their own endpoint.
    pub fn for_class(
        class: DeviceClass,
        unit_id: u8,
        sensors: SensorUnits,
        meter: Option<&MeterRef>,
    ) -> Self {
        let mut fields = Vec::with_capacity(4);
        match class {
            DeviceClass::Heatpump | DeviceClass::Groundpipe => {
                fields.push(FieldSpec::temperature(Field::InputTemp, sensors.input_temp));
                fields.push(FieldSpec::temperature(
                    Field::OutputTemp,
                    sensors.output_temp,
                ));
                fields.push(FieldSpec::flow(sensors.flow));
                if class == DeviceClass::Heatpump
                    && let Some(meter) = meter
                {
                    fields.push(FieldSpec::energy(
                        Field::Energy,
                        meter.unit_id,
                        Some(meter.endpoint.clone()),
                    ));
                }
            }
            DeviceClass::Elec => {
                fields.push(FieldSpec::energy(Field::TotalEnergy, unit_id, None));
            }
        }
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, field: Field) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.field == field)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.get(field).is_some()
    }

    /// Distinct endpoints this map reads from, `primary` first.
    pub fn endpoints(&self, primary: &Endpoint) -> Vec<Endpoint> {
        let mut out = vec![primary.clone()];
        for spec in &self.fields {
            if let Some(ep) = &spec.endpoint
                && !out.contains(ep)
            {
                out.push(ep.clone());
            }
        }
        out
    }
}

/// Immutable description of one configured device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Unique device identifier (e.g., "HP_1").
    pub id: String,
    pub class: DeviceClass,
    /// Gateway the device's sensors sit behind.
    pub endpoint: Endpoint,
    /// Default slave id (the meter id for power meters).
    pub unit_id: u8,
    pub poll_interval: Duration,
    pub register_map: RegisterMap,
}

/// Fields a class must read for a reading to be complete.
pub fn required_fields(class: DeviceClass) -> &'static [Field] {
    match class {
        DeviceClass::Heatpump | DeviceClass::Groundpipe => {
            &[Field::InputTemp, Field::OutputTemp, Field::Flow]
        }
        DeviceClass::Elec => &[Field::TotalEnergy],
    }
}

/// Fields a class may read at all.
pub fn allowed_fields(class: DeviceClass) -> &'static [Field] {
    match class {
        DeviceClass::Heatpump => &[
            Field::InputTemp,
            Field::OutputTemp,
            Field::Flow,
            Field::Energy,
        ],
        DeviceClass::Groundpipe => &[Field::InputTemp, Field::OutputTemp, Field::Flow],
        DeviceClass::Elec => &[Field::TotalEnergy],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heatpump_map_with_meter() {
        let meter = MeterRef {
            endpoint: Endpoint::new("192.168.1.200", 502),
            unit_id: 7,
        };
        let map = RegisterMap::for_class(
            DeviceClass::Heatpump,
            1,
            SensorUnits::default(),
            Some(&meter),
        );

        let fields: Vec<_> = map.fields().iter().map(|f| f.field).collect();
        assert_eq!(
            fields,
            [Field::InputTemp, Field::OutputTemp, Field::Flow, Field::Energy]
        );
        let flow = map.get(Field::Flow).unwrap();
        assert_eq!(flow.unit_id, 3);
        assert_eq!(flow.register, FLOW_REGISTER);
        assert_eq!(flow.word_order, WordOrder::LowFirst);
        let energy = map.get(Field::Energy).unwrap();
        assert_eq!(energy.unit_id, 7);
        assert_eq!(energy.endpoint.as_ref(), Some(&meter.endpoint));

        let primary = Endpoint::new("192.168.1.10", 8899);
        assert_eq!(map.endpoints(&primary), vec![primary, meter.endpoint]);
    }

    #[test]
    fn test_heatpump_map_without_meter() {
        let map = RegisterMap::for_class(DeviceClass::Heatpump, 1, SensorUnits::default(), None);
        assert!(!map.contains(Field::Energy));
        let primary = Endpoint::new("10.0.0.5", 8899);
        assert_eq!(map.endpoints(&primary).len(), 1);
    }

    #[test]
    fn test_elec_map_uses_meter_unit() {
        let map = RegisterMap::for_class(DeviceClass::Elec, 4, SensorUnits::default(), None);
        assert_eq!(map.fields().len(), 1);
        let spec = map.get(Field::TotalEnergy).unwrap();
        assert_eq!(spec.unit_id, 4);
        assert_eq!(spec.register, ENERGY_REGISTER);
        assert_eq!(spec.encoding.word_count(), 2);
    }

    #[test]
    fn test_field_spec_yaml_defaults() {
        let yaml = r#"
field: input_temp
unit_id: 9
register: 16
encoding: i16
scale: 0.1
"#;
        let spec: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.field, Field::InputTemp);
        assert_eq!(spec.word_order, WordOrder::HighFirst);
        assert!(spec.endpoint.is_none());
    }

    #[test]
    fn test_required_fields_subset_of_allowed() {
        for class in DeviceClass::ALL {
            for field in required_fields(class) {
                assert!(allowed_fields(class).contains(field));
            }
        }
    }
}
