//! Decoded readings
//!
//! A [`Reading`] is built once per poll cycle and never modified after it is
//! published. Its JSON form is the flat basic layout or the nested detailed
//! layout (`system`, `voltages`, `phase_1..3`), with the raw registers and
//! multipliers that produced it alongside.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scaling::MultiplierSet;

/// Which register block a reading was decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingMode {
    /// 22-register block, flat fields
    Basic,
    /// 64-register block with per-phase values
    Detailed,
}

/// A heuristic adjustment applied to a decoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    /// Phase 3 power at or above 100000 after scaling, divided by 10
    Phase3PowerOverflow,
    /// Power above its ceiling, divided by the power divisor
    PowerCeiling,
    /// Energy above its ceiling, divided by the energy divisor
    EnergyCeiling,
    /// Frequency outside the plausible band, recomputed from the raw register
    FrequencyBand,
}

/// Record of one corrected field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// What kind of correction was applied
    pub kind: CorrectionKind,
    /// Dotted field path, e.g. `phase_3.power_kw`
    pub field: String,
    /// Value before correction
    pub before: f64,
    /// Value after correction
    pub after: f64,
}

/// Raw registers kept with a basic reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicRawValues {
    /// Frequency register
    pub frequency: u16,
    /// Line-to-line voltage register
    pub voltage_ll: u16,
    /// Line-to-neutral voltage register
    pub voltage_ln: u16,
    /// Average current register
    pub current: u16,
    /// System power register
    pub power: u16,
    /// Apparent power factor register
    pub pf: u16,
}

/// Flat reading decoded from the basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicReading {
    /// When the block was read
    #[serde(with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Total active energy (kWh)
    pub energy_kwh: f64,
    /// Total active power (kW)
    pub power_kw: f64,
    /// Reactive power (kVAr)
    pub reactive_power_kvar: f64,
    /// Apparent power (kVA)
    pub apparent_power_kva: f64,
    /// Apparent power factor
    pub power_factor: f64,
    /// Average current (A)
    pub current_avg: f64,
    /// Average line-to-line voltage (V)
    pub voltage_ll_avg: f64,
    /// Average line-to-neutral voltage (V)
    pub voltage_ln_avg: f64,
    /// Line frequency (Hz)
    pub frequency: f64,
    /// Scalar the values were scaled with
    pub data_scalar: u16,
    /// Unscaled registers behind the headline values
    pub raw_values: BasicRawValues,
    /// Multipliers applied
    pub multipliers: MultiplierSet,
    /// Corrections applied by the plausibility stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<Correction>,
}

/// System totals from the detailed block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemValues {
    /// Total active energy (kWh)
    pub energy_kwh: f64,
    /// Total active power (kW)
    pub power_kw: f64,
    /// Peak demand (kW)
    pub demand_kw_max: f64,
    /// Present demand (kW)
    pub demand_kw_now: f64,
    /// Maximum power (kW)
    pub power_kw_max: f64,
    /// Minimum power (kW)
    pub power_kw_min: f64,
    /// Reactive energy (kVArh)
    pub reactive_energy_kvarh: f64,
    /// Reactive power (kVAr)
    pub reactive_power_kvar: f64,
    /// Apparent energy (kVAh)
    pub apparent_energy_kvah: f64,
    /// Apparent power (kVA)
    pub apparent_power_kva: f64,
    /// Displacement power factor
    pub displacement_pf: f64,
    /// Apparent power factor
    pub apparent_pf: f64,
    /// Average current (A)
    pub current_avg: f64,
    /// Average line-to-line voltage (V)
    pub voltage_ll_avg: f64,
    /// Average line-to-neutral voltage (V)
    pub voltage_ln_avg: f64,
}

/// Line-to-line voltages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterPhaseVoltages {
    /// L1 to L2 (V)
    pub l1_l2: f64,
    /// L2 to L3 (V)
    pub l2_l3: f64,
    /// L1 to L3 (V)
    pub l1_l3: f64,
}

/// Values for a single phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseValues {
    /// Active energy (kWh)
    pub energy_kwh: f64,
    /// Active power (kW)
    pub power_kw: f64,
    /// Reactive energy (kVArh)
    pub reactive_energy_kvarh: f64,
    /// Reactive power (kVAr)
    pub reactive_power_kvar: f64,
    /// Apparent energy (kVAh)
    pub apparent_energy_kvah: f64,
    /// Apparent power (kVA)
    pub apparent_power_kva: f64,
    /// Displacement power factor
    pub displacement_pf: f64,
    /// Apparent power factor
    pub apparent_pf: f64,
    /// Current (A)
    pub current: f64,
    /// Line-to-neutral voltage (V)
    pub voltage_ln: f64,
}

/// Raw registers kept with a detailed reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedRawValues {
    /// Frequency register
    pub frequency: u16,
    /// Average line-to-line voltage register
    pub voltage_ll_avg: u16,
    /// Average line-to-neutral voltage register
    pub voltage_ln_avg: u16,
    /// Average current register
    pub current_avg: u16,
    /// System power register
    pub power: u16,
    /// Apparent power factor register
    pub pf: u16,
    /// Data scalar register
    pub data_scalar: u16,
}

/// Nested reading decoded from the detailed block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedReading {
    /// When the block was read
    #[serde(with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Scalar the values were scaled with
    pub data_scalar: u16,
    /// Multipliers applied
    pub multipliers: MultiplierSet,
    /// System totals
    pub system: SystemValues,
    /// Line-to-line voltages
    pub voltages: InterPhaseVoltages,
    /// Line frequency (Hz)
    pub frequency: f64,
    /// Unscaled registers behind the headline values
    pub raw_values: DetailedRawValues,
    /// Phase 1 values
    pub phase_1: PhaseValues,
    /// Phase 2 values
    pub phase_2: PhaseValues,
    /// Phase 3 values
    pub phase_3: PhaseValues,
    /// Seconds since the meter's last reset
    pub time_since_reset: u32,
    /// Free-running tick counter
    pub data_tick_counter: u16,
    /// Corrections applied on decode and by the plausibility stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<Correction>,
}

impl DetailedReading {
    /// Phases in order, with their JSON key
    pub fn phases_mut(&mut self) -> [(&'static str, &mut PhaseValues); 3] {
        [
            ("phase_1", &mut self.phase_1),
            ("phase_2", &mut self.phase_2),
            ("phase_3", &mut self.phase_3),
        ]
    }
}

/// One published snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    /// Decoded from the 64-register block
    Detailed(DetailedReading),
    /// Decoded from the 22-register block
    Basic(BasicReading),
}

impl Reading {
    /// Block the reading was decoded from
    pub fn mode(&self) -> ReadingMode {
        match self {
            Reading::Basic(_) => ReadingMode::Basic,
            Reading::Detailed(_) => ReadingMode::Detailed,
        }
    }

    /// When the reading was taken
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Reading::Basic(r) => r.timestamp,
            Reading::Detailed(r) => r.timestamp,
        }
    }

    /// Total active power in kW
    pub fn power_kw(&self) -> f64 {
        match self {
            Reading::Basic(r) => r.power_kw,
            Reading::Detailed(r) => r.system.power_kw,
        }
    }

    /// Total active energy in kWh
    pub fn energy_kwh(&self) -> f64 {
        match self {
            Reading::Basic(r) => r.energy_kwh,
            Reading::Detailed(r) => r.system.energy_kwh,
        }
    }

    /// Line frequency in Hz
    pub fn frequency(&self) -> f64 {
        match self {
            Reading::Basic(r) => r.frequency,
            Reading::Detailed(r) => r.frequency,
        }
    }

    /// Scalar the multipliers were chosen for
    pub fn data_scalar(&self) -> u16 {
        match self {
            Reading::Basic(r) => r.data_scalar,
            Reading::Detailed(r) => r.data_scalar,
        }
    }

    /// Multipliers used to decode this reading
    pub fn multipliers(&self) -> &MultiplierSet {
        match self {
            Reading::Basic(r) => &r.multipliers,
            Reading::Detailed(r) => &r.multipliers,
        }
    }

    /// Corrections applied after decoding
    pub fn corrections(&self) -> &[Correction] {
        match self {
            Reading::Basic(r) => &r.corrections,
            Reading::Detailed(r) => &r.corrections,
        }
    }
}

impl From<BasicReading> for Reading {
    fn from(r: BasicReading) -> Self {
        Reading::Basic(r)
    }
}

impl From<DetailedReading> for Reading {
    fn from(r: DetailedReading) -> Self {
        Reading::Detailed(r)
    }
}

/// Timestamps as fractional Unix seconds
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(ts.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
            .ok_or_else(|| de::Error::custom(format!("timestamp {} out of range", secs)))
    }
}
