//! Reading normalizer.
//!
//! Turns a decoded sample into a typed [`Reading`] after range, plausibility and
//! ordering checks. A sample with any failing field is rejected whole.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::device::{DecodedSample, Field};
use crate::storage::{DeviceClass, Measurements, Reading};

/// Inclusive bounds a field must fall within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Largest value a u32 counter with 0.01 resolution can hold.
const ENERGY_MAX_KWH: f64 = 42_949_672.95;

/// Valid range per field.
pub fn valid_range(field: Field) -> ValidRange {
    match field {
        Field::InputTemp | Field::OutputTemp => ValidRange {
            min: -50.0,
            max: 200.0,
        },
        Field::Flow => ValidRange {
            min: 0.0,
            max: 10_000.0,
        },
        Field::Energy | Field::TotalEnergy => ValidRange {
            min: 0.0,
            max: ENERGY_MAX_KWH,
        },
    }
}

/// The last reading accepted for a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub timestamp: DateTime<Utc>,
    pub energy: Option<f64>,
}

impl Baseline {
    pub fn of(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp,
            energy: reading.energy(),
        }
    }
}

/// One reason a sample was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Violation {
    #[error("{field} missing")]
    Missing { field: Field },

    #[error("{field} = {value} outside [{min}, {max}]")]
    OutOfRange {
        field: Field,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} went backwards from {previous} to {current} without an acknowledged reset")]
    EnergyRegression {
        field: Field,
        previous: f64,
        current: f64,
    },

    #[error("timestamp {current} is not after {previous}")]
    StaleTimestamp {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

/// A sample rejected before reaching storage.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("reading from '{device_id}' rejected: {}", join_violations(.violations))]
pub struct ValidationError {
    pub device_id: String,
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    /// Whether `field` is among the failures.
    pub fn involves(&self, field: Field) -> bool {
        self.violations.iter().any(|v| match v {
            Violation::Missing { field: f }
            | Violation::OutOfRange { field: f, .. }
            | Violation::EnergyRegression { field: f, .. } => *f == field,
            Violation::StaleTimestamp { .. } => false,
        })
    }
}

struct Checker<'a> {
    sample: &'a DecodedSample,
    violations: Vec<Violation>,
}

impl Checker<'_> {
    fn ranged(&mut self, field: Field, value: f64) -> f64 {
        let range = valid_range(field);
        if !range.contains(value) {
            self.violations.push(Violation::OutOfRange {
                field,
                value,
                min: range.min,
                max: range.max,
            });
        }
        value
    }

    fn required(&mut self, field: Field) -> f64 {
        match self.sample.get(field) {
            Some(value) => self.ranged(field, value),
            None => {
                self.violations.push(Violation::Missing { field });
                f64::NAN
            }
        }
    }

    fn optional(&mut self, field: Field) -> Option<f64> {
        self.sample.get(field).map(|v| self.ranged(field, v))
    }

    /// Returns whether the counter restarted under an acknowledged reset.
    fn counter(
        &mut self,
        field: Field,
        current: Option<f64>,
        baseline: Option<&Baseline>,
        reset_acknowledged: bool,
    ) -> bool {
        let (Some(current), Some(previous)) = (current, baseline.and_then(|b| b.energy)) else {
            return false;
        };
        if current.is_nan() || current >= previous {
            return false;
        }
        if reset_acknowledged {
            return true;
        }
        self.violations.push(Violation::EnergyRegression {
            field,
            previous,
            current,
        });
        false
    }
}

/// Validate a decoded sample and build the reading for `class`.
///
/// `baseline` is the device's last accepted reading. A counter regression is
/// only accepted when `reset_acknowledged` is set, and the reading is then
/// flagged `meter_reset`.
pub fn normalize(
    class: DeviceClass,
    sample: &DecodedSample,
    baseline: Option<&Baseline>,
    reset_acknowledged: bool,
) -> Result<Reading, ValidationError> {
    let mut check = Checker {
        sample,
        violations: Vec::new(),
    };

    if let Some(b) = baseline
        && sample.timestamp <= b.timestamp
    {
        check.violations.push(Violation::StaleTimestamp {
            previous: b.timestamp,
            current: sample.timestamp,
        });
    }

    let values = match class {
        DeviceClass::Heatpump => {
            let input_temp = check.required(Field::InputTemp);
            let output_temp = check.required(Field::OutputTemp);
            let flow = check.required(Field::Flow);
            let energy = check.optional(Field::Energy);
            let meter_reset = check.counter(Field::Energy, energy, baseline, reset_acknowledged);
            Measurements::Heatpump {
                input_temp,
                output_temp,
                flow,
                energy,
                meter_reset,
            }
        }
        DeviceClass::Groundpipe => Measurements::Groundpipe {
            input_temp: check.required(Field::InputTemp),
            output_temp: check.required(Field::OutputTemp),
            flow: check.required(Field::Flow),
        },
        DeviceClass::Elec => {
            let total_energy = check.required(Field::TotalEnergy);
            let meter_reset = check.counter(
                Field::TotalEnergy,
                Some(total_energy),
                baseline,
                reset_acknowledged,
            );
            Measurements::Elec {
                total_energy,
                meter_reset,
            }
        }
    };

    if !check.violations.is_empty() {
        return Err(ValidationError {
            device_id: sample.device_id.clone(),
            violations: check.violations,
        });
    }

    Ok(Reading {
        device_id: sample.device_id.clone(),
        timestamp: sample.timestamp,
        values,
    })
}
