//! Scalar-dependent multiplier table
//!
//! The meter reports raw integers; the value of the data scalar register
//! selects how they convert to engineering units (table D-1 of the meter
//! manual). Scalar 15 has its own hard-coded set, and anything from 6 upward
//! other than 15 behaves like 6.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Frequency multiplier shared by every table entry
pub const STANDARD_FREQUENCY_MULTIPLIER: f64 = 0.005;

/// Scalar assumed when the scalar register can't be read
pub const DEFAULT_SCALAR: u16 = 3;

/// Highest scalar with its own table entry
const MAX_TABLE_SCALAR: u16 = 6;

/// Scalar with its own hard-coded multiplier set
const SPECIAL_SCALAR: u16 = 15;

/// (power, pf, current, voltage) per scalar 0..=6
const SCALAR_TABLE: [(f64, f64, f64, f64); 7] = [
    (0.00001, 0.01, 0.01, 0.1),
    (0.001, 0.01, 0.1, 0.1),
    (0.01, 0.01, 0.1, 0.1),
    (0.1, 0.01, 0.1, 0.1),
    (1.0, 0.01, 1.0, 1.0),
    (10.0, 0.01, 1.0, 1.0),
    (100.0, 0.01, 1.0, 1.0),
];

/// Per-class multipliers applied to raw register values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiplierSet {
    /// kW, kWh, kVA, kVAh, kVAR, kVARh
    pub power: f64,
    /// Power factor
    pub pf: f64,
    /// Amps
    pub current: f64,
    /// Volts
    pub voltage: f64,
    /// Hz
    pub frequency: f64,
}

impl MultiplierSet {
    /// Set used when the scalar is unknown
    pub const FALLBACK: MultiplierSet = MultiplierSet {
        power: 1.0,
        pf: 0.01,
        current: 1.0,
        voltage: 1.0,
        frequency: 0.01,
    };

    /// Set for scalar 15
    pub const SCALAR_15: MultiplierSet = MultiplierSet {
        power: 0.1,
        pf: 0.01,
        current: 0.1,
        voltage: 0.1,
        frequency: 0.005,
    };

    /// Table entry for a standard scalar (0..=6)
    pub fn for_standard(scalar: u16) -> Option<Self> {
        SCALAR_TABLE
            .get(scalar as usize)
            .map(|&(power, pf, current, voltage)| MultiplierSet {
                power,
                pf,
                current,
                voltage,
                frequency: STANDARD_FREQUENCY_MULTIPLIER,
            })
    }
}

impl Default for MultiplierSet {
    /// Default manual override set
    fn default() -> Self {
        MultiplierSet {
            power: 0.1,
            pf: 0.01,
            current: 0.1,
            voltage: 0.1,
            frequency: 0.005,
        }
    }
}

/// How the multiplier set for a reading was chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarSelection {
    /// Table entry; scalars above 6 other than 15 are already clamped to 6
    Standard(u16),
    /// Hard-coded set for scalar 15
    Special15,
    /// Operator-supplied set, bypassing the table
    ManualOverride(MultiplierSet),
}

impl ScalarSelection {
    /// Classify a scalar register value, unless a manual override applies
    pub fn select(scalar: u16, manual: Option<MultiplierSet>) -> Self {
        match (manual, scalar) {
            (Some(set), _) => ScalarSelection::ManualOverride(set),
            (None, SPECIAL_SCALAR) => ScalarSelection::Special15,
            (None, s) => ScalarSelection::Standard(s.min(MAX_TABLE_SCALAR)),
        }
    }

    /// Multiplier set for this selection
    pub fn multipliers(&self) -> MultiplierSet {
        match *self {
            ScalarSelection::ManualOverride(set) => {
                info!("Using manual scaling overrides: {:?}", set);
                set
            }
            ScalarSelection::Special15 => {
                info!("Using special multipliers for scalar value 15");
                MultiplierSet::SCALAR_15
            }
            ScalarSelection::Standard(scalar) => {
                MultiplierSet::for_standard(scalar).unwrap_or_else(|| {
                    warn!("Unknown scalar value: {}, using default multipliers", scalar);
                    MultiplierSet::FALLBACK
                })
            }
        }
    }
}

/// Multiplier set for `scalar`, or the manual set when one is given
pub fn multipliers_for(scalar: u16, manual: Option<MultiplierSet>) -> MultiplierSet {
    ScalarSelection::select(scalar, manual).multipliers()
}
