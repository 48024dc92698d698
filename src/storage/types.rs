//! Core data types for the storage layer.
//!
//! - [`DeviceClass`]: The three device families, one table each
//! - [`Reading`] / [`Measurements`]: The persisted unit, tagged by device class
//! - [`Event`]: Structured system records (startup, shutdown, data loss)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Device family. Each class owns one time-series table.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceClass {
    /// Heat pump: supply/return temperatures, flow and cumulative energy.
    Heatpump,
    /// Underground pipe loop: supply/return temperatures and flow.
    Groundpipe,
    /// Power meter: cumulative energy.
    Elec,
}

impl DeviceClass {
    /// All classes, in table creation order.
    pub const ALL: [DeviceClass; 3] = [Self::Heatpump, Self::Groundpipe, Self::Elec];

    /// Name of the table holding this class's readings.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Heatpump => "heatpump",
            Self::Groundpipe => "groundpipe",
            Self::Elec => "elec",
        }
    }

    /// Column holding the cumulative energy counter, if the class has one.
    pub fn energy_column(&self) -> Option<&'static str> {
        match self {
            Self::Heatpump => Some("energy"),
            Self::Groundpipe => None,
            Self::Elec => Some("total_energy"),
        }
    }
}

/// Class-specific measurement values of a [`Reading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase")]
pub enum Measurements {
    Heatpump {
        /// Supply temperature in °C.
        input_temp: f64,
        /// Return temperature in °C.
        output_temp: f64,
        /// Flow in L/min.
        flow: f64,
        /// Cumulative energy in kWh; `None` when no meter is wired to the pump.
        energy: Option<f64>,
        /// Set on the first reading after an acknowledged meter reset.
        meter_reset: bool,
    },
    Groundpipe {
        input_temp: f64,
        output_temp: f64,
        flow: f64,
    },
    Elec {
        /// Cumulative energy in kWh.
        total_energy: f64,
        meter_reset: bool,
    },
}

/// A validated reading, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Configured device identifier.
    pub device_id: String,
    /// Acquisition start time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Class-specific values.
    pub values: Measurements,
}

/// Specific heat of water in kJ/(kg·°C), at 1 kg per litre.
const WATER_HEAT_CAPACITY: f64 = 4.186;
/// Below this outlet/inlet difference (°C) heat output is noise.
const MIN_TEMP_DIFF: f64 = 0.1;

impl Reading {
    /// Device class derived from the measurement variant.
    pub fn class(&self) -> DeviceClass {
        match self.values {
            Measurements::Heatpump { .. } => DeviceClass::Heatpump,
            Measurements::Groundpipe { .. } => DeviceClass::Groundpipe,
            Measurements::Elec { .. } => DeviceClass::Elec,
        }
    }

    /// Cumulative energy counter, if present.
    pub fn energy(&self) -> Option<f64> {
        match self.values {
            Measurements::Heatpump { energy, .. } => energy,
            Measurements::Groundpipe { .. } => None,
            Measurements::Elec { total_energy, .. } => Some(total_energy),
        }
    }

    /// Whether this reading starts a new energy counter segment.
    pub fn meter_reset(&self) -> bool {
        match self.values {
            Measurements::Heatpump { meter_reset, .. } | Measurements::Elec { meter_reset, .. } => {
                meter_reset
            }
            Measurements::Groundpipe { .. } => false,
        }
    }

    /// Heat carried by the water loop in kW: flow (L/min) times the
    /// outlet/inlet difference times the heat capacity of water.
    ///
    /// `None` for meters and when the difference is below 0.1 °C.
    pub fn heat_output_kw(&self) -> Option<f64> {
        let (input_temp, output_temp, flow) = match self.values {
            Measurements::Heatpump {
                input_temp,
                output_temp,
                flow,
                ..
            }
            | Measurements::Groundpipe {
                input_temp,
                output_temp,
                flow,
            } => (input_temp, output_temp, flow),
            Measurements::Elec { .. } => return None,
        };
        let delta = output_temp - input_temp;
        if delta.abs() < MIN_TEMP_DIFF {
            return None;
        }
        Some(flow * delta * WATER_HEAT_CAPACITY / 60.0)
    }

    /// Coefficient of performance over the interval since `previous`, rounded to
    /// two decimals.
    ///
    /// Electrical power is the energy counter delta over the elapsed time. `None`
    /// across a meter reset, without energy on both readings, or when no power
    /// was drawn.
    pub fn cop_since(&self, previous: &Reading) -> Option<f64> {
        if self.meter_reset() {
            return None;
        }
        let consumed = self.energy()? - previous.energy()?;
        let hours = (self.timestamp - previous.timestamp).num_microseconds()? as f64 / 3.6e9;
        if consumed <= 0.0 || hours <= 0.0 {
            return None;
        }
        let cop = (self.heat_output_kw()? / (consumed / hours)).abs();
        Some((cop * 100.0).round() / 100.0)
    }
}

/// An event record stored in the `events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Auto-generated event identifier.
    pub id: Option<i64>,
    /// Event timestamp (UTC).
    pub ts: DateTime<Utc>,
    /// Event origin (e.g., "supervisor", "ingest.writer", "device.HP_1").
    pub source: String,
    /// Event nature/handling class.
    pub kind: EventKind,
    /// Delivery priority/urgency.
    pub severity: EventSeverity,
    /// Short human-readable description.
    pub message: String,
    /// Context snapshot as JSON.
    pub payload: Option<serde_json::Value>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(
        source: impl Into<String>,
        kind: EventKind,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            ts: Utc::now(),
            source: source.into(),
            kind,
            severity,
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a JSON payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Event kind classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EventKind {
    /// Lifecycle of the pipeline (startup, shutdown, device stop/restart).
    System,
    /// Device-level condition worth keeping (e.g., acknowledged meter reset).
    Device,
    /// Readings were dropped before reaching storage.
    DataLoss,
}

/// Event severity classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_device_class_from_str_case_insensitive() {
        assert_eq!(
            DeviceClass::from_str("HeatPump").unwrap(),
            DeviceClass::Heatpump
        );
        assert_eq!(
            DeviceClass::from_str("groundpipe").unwrap(),
            DeviceClass::Groundpipe
        );
        assert_eq!(DeviceClass::from_str("ELEC").unwrap(), DeviceClass::Elec);
        assert!(DeviceClass::from_str("boiler").is_err());
    }

    #[test]
    fn test_device_class_tables() {
        let tables: Vec<_> = DeviceClass::ALL.iter().map(|c| c.table()).collect();
        assert_eq!(tables, ["heatpump", "groundpipe", "elec"]);
        assert_eq!(DeviceClass::Groundpipe.energy_column(), None);
        assert_eq!(DeviceClass::Elec.energy_column(), Some("total_energy"));
    }

    #[test]
    fn test_reading_accessors() {
        let reading = Reading {
            device_id: "HP_1".to_string(),
            timestamp: Utc::now(),
            values: Measurements::Heatpump {
                input_temp: 35.2,
                output_temp: 30.1,
                flow: 12.5,
                energy: Some(1024.5),
                meter_reset: false,
            },
        };
        assert_eq!(reading.class(), DeviceClass::Heatpump);
        assert_eq!(reading.energy(), Some(1024.5));
        assert!(!reading.meter_reset());

        let pipe = Reading {
            device_id: "GP_1".to_string(),
            timestamp: Utc::now(),
            values: Measurements::Groundpipe {
                input_temp: 12.0,
                output_temp: 9.5,
                flow: 40.0,
            },
        };
        assert_eq!(pipe.class(), DeviceClass::Groundpipe);
        assert_eq!(pipe.energy(), None);
    }

    fn pump_at(ts: DateTime<Utc>, input_temp: f64, output_temp: f64, energy: f64) -> Reading {
        Reading {
            device_id: "HP_1".to_string(),
            timestamp: ts,
            values: Measurements::Heatpump {
                input_temp,
                output_temp,
                flow: 12.0,
                energy: Some(energy),
                meter_reset: false,
            },
        }
    }

    #[test]
    fn test_heat_output_kw() {
        let t0 = Utc::now();
        let reading = pump_at(t0, 30.0, 35.0, 100.0);
        assert!((reading.heat_output_kw().unwrap() - 4.186).abs() < 1e-9);

        // Cooling direction keeps its sign.
        let cooling = pump_at(t0, 35.0, 30.0, 100.0);
        assert!((cooling.heat_output_kw().unwrap() + 4.186).abs() < 1e-9);

        assert_eq!(pump_at(t0, 30.0, 30.05, 100.0).heat_output_kw(), None);
        let meter = Reading {
            device_id: "EM_1".to_string(),
            timestamp: t0,
            values: Measurements::Elec {
                total_energy: 10.0,
                meter_reset: false,
            },
        };
        assert_eq!(meter.heat_output_kw(), None);
    }

    #[test]
    fn test_cop_since() {
        let t0 = Utc::now();
        let previous = pump_at(t0, 30.0, 35.0, 100.0);
        // 1 kWh over one hour is 1 kW against 4.186 kW of heat.
        let current = pump_at(t0 + chrono::Duration::hours(1), 30.0, 35.0, 101.0);
        assert_eq!(current.cop_since(&previous), Some(4.19));

        // No energy drawn, flat temperatures, or a reset yield nothing.
        let idle = pump_at(t0 + chrono::Duration::hours(1), 30.0, 35.0, 100.0);
        assert_eq!(idle.cop_since(&previous), None);
        let flat = pump_at(t0 + chrono::Duration::hours(1), 30.0, 30.0, 101.0);
        assert_eq!(flat.cop_since(&previous), None);
        let mut reset = current.clone();
        if let Measurements::Heatpump { meter_reset, .. } = &mut reset.values {
            *meter_reset = true;
        }
        assert_eq!(reset.cop_since(&previous), None);
        assert_eq!(previous.cop_since(&current), None);
    }

    #[test]
    fn test_measurements_serialize_tagged() {
        let values = Measurements::Elec {
            total_energy: 12.34,
            meter_reset: true,
        };
        let json = serde_json::to_value(&values).unwrap();
        assert_eq!(json["class"], "elec");
        assert_eq!(json["total_energy"], 12.34);
    }

    #[test]
    fn test_event_kind_round_trip_strings() {
        assert_eq!(EventKind::DataLoss.as_ref(), "data_loss");
        assert_eq!(EventKind::from_str("DATA_LOSS").unwrap(), EventKind::DataLoss);
        assert_eq!(
            EventSeverity::from_str("Critical").unwrap(),
            EventSeverity::Critical
        );
        assert!(EventSeverity::from_str("fatal").is_err());
    }
}
