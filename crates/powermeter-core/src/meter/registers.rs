//! Register map
//!
//! Logical ("4xxxx") addresses of the registers the poller knows by name.
//! The basic block covers 44001..=44022, the detailed block 44001..=44064.

use std::ops::RangeInclusive;

/// First register of both the basic and the detailed block
pub const BLOCK_START: u16 = 44001;

/// Registers in the basic block
pub const BASIC_BLOCK_LEN: u16 = 22;

/// Registers in the detailed block
pub const DETAILED_BLOCK_LEN: u16 = 64;

/// Total active energy, low word
pub const ENERGY_KWH_LSW: u16 = 44001;
/// Total active energy, high word
pub const ENERGY_KWH_MSW: u16 = 44002;
/// Total active power
pub const POWER_KW: u16 = 44003;
/// Peak demand
pub const DEMAND_KW_MAX: u16 = 44004;
/// Present demand
pub const DEMAND_KW_NOW: u16 = 44005;
/// Maximum power
pub const POWER_KW_MAX: u16 = 44006;
/// Minimum power
pub const POWER_KW_MIN: u16 = 44007;
/// Reactive energy, low word
pub const REACTIVE_ENERGY_KVARH_LSW: u16 = 44008;
/// Reactive energy, high word
pub const REACTIVE_ENERGY_KVARH_MSW: u16 = 44009;
/// Reactive power
pub const REACTIVE_POWER_KVAR: u16 = 44010;
/// Apparent energy, low word
pub const APPARENT_ENERGY_KVAH_LSW: u16 = 44011;
/// Apparent energy, high word
pub const APPARENT_ENERGY_KVAH_MSW: u16 = 44012;
/// Apparent power
pub const APPARENT_POWER_KVA: u16 = 44013;
/// Displacement power factor
pub const DISPLACEMENT_PF: u16 = 44014;
/// Apparent power factor
pub const APPARENT_PF: u16 = 44015;
/// Average current
pub const CURRENT_AVG: u16 = 44016;
/// Average line-to-line voltage
pub const VOLTAGE_LL_AVG: u16 = 44017;
/// Average line-to-neutral voltage
pub const VOLTAGE_LN_AVG: u16 = 44018;
/// L1 to L2 voltage
pub const VOLTAGE_L1_L2: u16 = 44019;
/// L2 to L3 voltage
pub const VOLTAGE_L2_L3: u16 = 44020;
/// L1 to L3 voltage
pub const VOLTAGE_L1_L3: u16 = 44021;
/// Line frequency
pub const FREQUENCY: u16 = 44022;
/// Phase 1 energy, low word
pub const ENERGY_KWH_L1_LSW: u16 = 44023;
/// Phase 1 energy, high word
pub const ENERGY_KWH_L1_MSW: u16 = 44024;
/// Phase 2 energy, low word
pub const ENERGY_KWH_L2_LSW: u16 = 44025;
/// Phase 2 energy, high word
pub const ENERGY_KWH_L2_MSW: u16 = 44026;
/// Phase 3 energy, low word
pub const ENERGY_KWH_L3_LSW: u16 = 44027;
/// Phase 3 energy, high word
pub const ENERGY_KWH_L3_MSW: u16 = 44028;
/// Time since reset, low word
pub const TIME_SINCE_RESET_LSW: u16 = 44062;
/// Time since reset, high word
pub const TIME_SINCE_RESET_MSW: u16 = 44063;
/// Free-running counter, used as the fallback connection check
pub const DATA_TICK_COUNTER: u16 = 44064;

/// Selects the multiplier set
pub const DATA_SCALAR: u16 = 44602;
/// Demand averaging window (minutes)
pub const DEMAND_WINDOW_SIZE: u16 = 44603;

const NAMED: &[(&str, u16)] = &[
    ("ENERGY_KWH_LSW", ENERGY_KWH_LSW),
    ("ENERGY_KWH_MSW", ENERGY_KWH_MSW),
    ("POWER_KW", POWER_KW),
    ("DEMAND_KW_MAX", DEMAND_KW_MAX),
    ("DEMAND_KW_NOW", DEMAND_KW_NOW),
    ("POWER_KW_MAX", POWER_KW_MAX),
    ("POWER_KW_MIN", POWER_KW_MIN),
    ("REACTIVE_ENERGY_KVARH_LSW", REACTIVE_ENERGY_KVARH_LSW),
    ("REACTIVE_ENERGY_KVARH_MSW", REACTIVE_ENERGY_KVARH_MSW),
    ("REACTIVE_POWER_KVAR", REACTIVE_POWER_KVAR),
    ("APPARENT_ENERGY_KVAH_LSW", APPARENT_ENERGY_KVAH_LSW),
    ("APPARENT_ENERGY_KVAH_MSW", APPARENT_ENERGY_KVAH_MSW),
    ("APPARENT_POWER_KVA", APPARENT_POWER_KVA),
    ("DISPLACEMENT_PF", DISPLACEMENT_PF),
    ("APPARENT_PF", APPARENT_PF),
    ("CURRENT_AVG", CURRENT_AVG),
    ("VOLTAGE_LL_AVG", VOLTAGE_LL_AVG),
    ("VOLTAGE_LN_AVG", VOLTAGE_LN_AVG),
    ("VOLTAGE_L1_L2", VOLTAGE_L1_L2),
    ("VOLTAGE_L2_L3", VOLTAGE_L2_L3),
    ("VOLTAGE_L1_L3", VOLTAGE_L1_L3),
    ("FREQUENCY", FREQUENCY),
    ("ENERGY_KWH_L1_LSW", ENERGY_KWH_L1_LSW),
    ("ENERGY_KWH_L1_MSW", ENERGY_KWH_L1_MSW),
    ("ENERGY_KWH_L2_LSW", ENERGY_KWH_L2_LSW),
    ("ENERGY_KWH_L2_MSW", ENERGY_KWH_L2_MSW),
    ("ENERGY_KWH_L3_LSW", ENERGY_KWH_L3_LSW),
    ("ENERGY_KWH_L3_MSW", ENERGY_KWH_L3_MSW),
    ("TIME_SINCE_RESET_LSW", TIME_SINCE_RESET_LSW),
    ("TIME_SINCE_RESET_MSW", TIME_SINCE_RESET_MSW),
    ("DATA_TICK_COUNTER", DATA_TICK_COUNTER),
    ("DATA_SCALAR", DATA_SCALAR),
    ("DEMAND_WINDOW_SIZE", DEMAND_WINDOW_SIZE),
];

/// Named sets of registers read together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    /// Headline values
    Basic,
    /// Energy counters
    Energy,
    /// Power values
    Power,
    /// The whole basic block
    System,
    /// Phase 1 block
    Phase1,
    /// Phase 2 block
    Phase2,
    /// Phase 3 block
    Phase3,
}

impl RegisterGroup {
    /// Look up a group by name, ignoring case ("basic", "PHASE_1", ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BASIC" => Some(Self::Basic),
            "ENERGY" => Some(Self::Energy),
            "POWER" => Some(Self::Power),
            "SYSTEM" => Some(Self::System),
            "PHASE_1" => Some(Self::Phase1),
            "PHASE_2" => Some(Self::Phase2),
            "PHASE_3" => Some(Self::Phase3),
            _ => None,
        }
    }

    /// Registers in this group
    pub fn registers(self) -> Vec<u16> {
        match self {
            Self::Basic => vec![
                POWER_KW,
                CURRENT_AVG,
                VOLTAGE_LL_AVG,
                VOLTAGE_LN_AVG,
                FREQUENCY,
                DISPLACEMENT_PF,
            ],
            Self::Energy => vec![
                ENERGY_KWH_LSW,
                ENERGY_KWH_MSW,
                REACTIVE_ENERGY_KVARH_LSW,
                REACTIVE_ENERGY_KVARH_MSW,
                APPARENT_ENERGY_KVAH_LSW,
                APPARENT_ENERGY_KVAH_MSW,
            ],
            Self::Power => vec![POWER_KW, REACTIVE_POWER_KVAR, APPARENT_POWER_KVA],
            Self::System => range(44001..=44022),
            Self::Phase1 => range(44023..=44030),
            Self::Phase2 => range(44031..=44039),
            Self::Phase3 => range(44040..=44049),
        }
    }
}

fn range(r: RangeInclusive<u16>) -> Vec<u16> {
    r.collect()
}

/// Name of a logical register, or `UNKNOWN_<address>`
pub fn register_name(address: u16) -> String {
    NAMED
        .iter()
        .find(|(_, a)| *a == address)
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| format!("UNKNOWN_{}", address))
}

/// Logical address of a named register
pub fn register_address(name: &str) -> Option<u16> {
    NAMED
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, a)| *a)
}

/// Logical address from a register name or a decimal address
pub fn parse_register(text: &str) -> Option<u16> {
    text.trim()
        .parse::<u16>()
        .ok()
        .or_else(|| register_address(text.trim()))
}

/// Registers in the named group; empty for an unknown group
pub fn register_group(name: &str) -> Vec<u16> {
    RegisterGroup::from_name(name)
        .map(RegisterGroup::registers)
        .unwrap_or_default()
}
