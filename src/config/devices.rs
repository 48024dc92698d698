//! Device configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{
    DeviceDescriptor, Endpoint, FieldSpec, MeterRef, RegisterMap, SensorUnits, allowed_fields,
    required_fields,
};
use crate::storage::DeviceClass;

use super::validation::ConfigError;

/// Default port of the RS-485 to TCP gateways.
pub const DEFAULT_GATEWAY_PORT: u16 = 8899;

/// Default port of the power meter gateway.
pub const DEFAULT_METER_PORT: u16 = 502;

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

fn default_meter_port() -> u16 {
    DEFAULT_METER_PORT
}

fn default_unit_id() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Power meter a heat pump's energy is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyMeterConfig {
    pub host: String,

    #[serde(default = "default_meter_port")]
    pub port: u16,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

/// One configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device id (e.g., "HP_1").
    pub id: String,

    pub class: DeviceClass,

    /// Gateway host.
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Slave id; for power meters, the meter itself.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides `polling.default_interval`.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,

    #[serde(default)]
    pub sensor_units: SensorUnits,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_meter: Option<EnergyMeterConfig>,

    /// Explicit register map, replacing the class default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registers: Option<Vec<FieldSpec>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, class: DeviceClass, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class,
            host: host.into(),
            port: DEFAULT_GATEWAY_PORT,
            unit_id: 1,
            enabled: true,
            poll_interval: None,
            sensor_units: SensorUnits::default(),
            energy_meter: None,
            registers: None,
            description: None,
        }
    }

    pub fn register_map(&self) -> RegisterMap {
        match &self.registers {
            Some(fields) => RegisterMap::new(fields.clone()),
            None => {
                let meter = self.energy_meter.as_ref().map(|m| MeterRef {
                    endpoint: Endpoint::new(m.host.clone(), m.port),
                    unit_id: m.unit_id,
                });
                RegisterMap::for_class(self.class, self.unit_id, self.sensor_units, meter.as_ref())
            }
        }
    }

    pub fn to_descriptor(&self, default_interval: Duration) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.id.clone(),
            class: self.class,
            endpoint: Endpoint::new(self.host.clone(), self.port),
            unit_id: self.unit_id,
            poll_interval: self.poll_interval.unwrap_or(default_interval),
            register_map: self.register_map(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::ValidationError(format!("device '{}': {msg}", self.id));

        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero".to_string()));
        }
        if self.poll_interval.is_some_and(|d| d.is_zero()) {
            return Err(invalid("poll_interval must be positive".to_string()));
        }
        if let Some(meter) = &self.energy_meter {
            if self.class != DeviceClass::Heatpump {
                return Err(invalid(format!(
                    "energy_meter is only valid for heatpump devices, not {}",
                    self.class
                )));
            }
            if meter.host.trim().is_empty() || meter.port == 0 {
                return Err(invalid("energy_meter needs a host and a non-zero port".to_string()));
            }
        }

        let map = self.register_map();
        let mut fields = HashSet::new();
        for spec in map.fields() {
            if !allowed_fields(self.class).contains(&spec.field) {
                return Err(invalid(format!(
                    "field '{}' is not valid for class {}",
                    spec.field, self.class
                )));
            }
            if !fields.insert(spec.field) {
                return Err(invalid(format!("field '{}' mapped twice", spec.field)));
            }
            if !spec.scale.is_finite() || spec.scale == 0.0 {
                return Err(invalid(format!(
                    "field '{}' has an invalid scale {}",
                    spec.field, spec.scale
                )));
            }
        }
        if let Some(missing) = required_fields(self.class)
            .iter()
            .find(|f| !map.contains(**f))
        {
            return Err(invalid(format!("register map lacks required field '{missing}'")));
        }
        Ok(())
    }
}

/// Device list as found in a device file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl DevicesConfig {
    pub fn merge(mut self, other: DevicesConfig) -> Self {
        self.devices.extend(other.devices);
        self
    }

    /// Validate every device and reject duplicate ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "device id must not be empty".to_string(),
                ));
            }
            if !seen_ids.insert(device.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate device id: '{}'",
                    device.id
                )));
            }
            device.validate()?;
        }
        Ok(())
    }

    /// Load and merge every `.yaml`/`.yml` file in `dir_path`, in name order.
    pub fn load_from_dir(dir_path: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(dir_path);
        if !dir.exists() {
            return Err(ConfigError::ValidationError(format!(
                "device_path '{}' does not exist",
                dir_path
            )));
        }
        if !dir.is_dir() {
            return Err(ConfigError::ValidationError(format!(
                "device_path '{}' is not a directory",
                dir_path
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext == "yaml" || ext == "yml" {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!("Loading device config from: {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            let file_config: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::ValidationError(format!("failed to parse '{}': {}", path.display(), e))
            })?;
            merged = merged.merge(file_config);
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Encoding, Field, WordOrder};
    use tempfile::tempdir;

    fn config(devices: Vec<DeviceConfig>) -> DevicesConfig {
        DevicesConfig { devices }
    }

    #[test]
    fn test_device_config_serde_defaults() {
        let yaml = r#"
id: HP_1
class: heatpump
host: 192.168.1.101
energy_meter:
  host: 192.168.1.200
  unit_id: 5
"#;
        let device: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(device.port, 8899);
        assert_eq!(device.unit_id, 1);
        assert!(device.enabled);
        assert_eq!(device.sensor_units, SensorUnits::default());
        let meter = device.energy_meter.as_ref().unwrap();
        assert_eq!(meter.port, 502);

        let descriptor = device.to_descriptor(Duration::from_secs(60));
        assert_eq!(descriptor.poll_interval, Duration::from_secs(60));
        let energy = descriptor.register_map.get(Field::Energy).unwrap();
        assert_eq!(energy.unit_id, 5);
        assert_eq!(
            energy.endpoint,
            Some(Endpoint::new("192.168.1.200", 502))
        );
    }

    #[test]
    fn test_poll_interval_override() {
        let yaml = "id: EM_1\nclass: elec\nhost: 10.0.0.5\nport: 502\nunit_id: 7\npoll_interval: 15s\n";
        let device: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        let descriptor = device.to_descriptor(Duration::from_secs(60));
        assert_eq!(descriptor.poll_interval, Duration::from_secs(15));
        assert_eq!(
            descriptor.register_map.get(Field::TotalEnergy).unwrap().unit_id,
            7
        );
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let cfg = config(vec![
            DeviceConfig::new("HP_1", DeviceClass::Heatpump, "10.0.0.1"),
            DeviceConfig::new("HP_1", DeviceClass::Groundpipe, "10.0.0.2"),
        ]);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate device id"));
    }

    #[test]
    fn test_validate_meter_on_groundpipe() {
        let mut device = DeviceConfig::new("GP_1", DeviceClass::Groundpipe, "10.0.0.1");
        device.energy_meter = Some(EnergyMeterConfig {
            host: "10.0.0.200".to_string(),
            port: 502,
            unit_id: 1,
        });
        let err = config(vec![device]).validate().unwrap_err();
        assert!(err.to_string().contains("only valid for heatpump"));
    }

    #[test]
    fn test_validate_explicit_map_missing_required_field() {
        let mut device = DeviceConfig::new("GP_1", DeviceClass::Groundpipe, "10.0.0.1");
        device.registers = Some(vec![FieldSpec {
            field: Field::Flow,
            unit_id: 3,
            register: 0x22,
            encoding: Encoding::U32,
            word_order: WordOrder::LowFirst,
            scale: 0.01,
            endpoint: None,
        }]);
        let err = config(vec![device]).validate().unwrap_err();
        assert!(err.to_string().contains("required field 'input_temp'"));
    }

    #[test]
    fn test_validate_field_not_allowed_for_class() {
        let mut device = DeviceConfig::new("EM_1", DeviceClass::Elec, "10.0.0.1");
        device.registers = Some(vec![FieldSpec {
            field: Field::Flow,
            unit_id: 1,
            register: 0x22,
            encoding: Encoding::U32,
            word_order: WordOrder::LowFirst,
            scale: 0.01,
            endpoint: None,
        }]);
        let err = config(vec![device]).validate().unwrap_err();
        assert!(err.to_string().contains("not valid for class elec"));
    }

    #[test]
    fn test_load_from_dir_merges_yaml_files() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "devices:\n  - id: HP_1\n    class: heatpump\n    host: 10.0.0.1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.yml"),
            "devices:\n  - id: EM_1\n    class: elec\n    host: 10.0.0.200\n    port: 502\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = DevicesConfig::load_from_dir(dir.path().to_str().unwrap()).unwrap();
        let ids: Vec<_> = loaded.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["HP_1", "EM_1"]);
        loaded.validate().unwrap();
    }

    #[test]
    fn test_load_from_missing_dir() {
        let err = DevicesConfig::load_from_dir("/definitely/not/here").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
