//! Register block decoding
//!
//! Turns a raw register block into a [`BasicReading`] or [`DetailedReading`].
//! Indices below are offsets from 44001. 32-bit counters are stored low word
//! first: `(block[i + 1] << 16) | block[i]`.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{
    error::DecodeError,
    reading::{
        BasicRawValues, BasicReading, Correction, CorrectionKind, DetailedRawValues,
        DetailedReading, InterPhaseVoltages, PhaseValues, SystemValues,
    },
    registers::{BASIC_BLOCK_LEN, DETAILED_BLOCK_LEN},
    scaling::MultiplierSet,
};

/// Scaled phase 3 power at which the extra divide-by-10 applies
pub const PHASE3_POWER_OVERFLOW_KW: f64 = 100_000.0;

/// Combine a most/least significant register pair into one 32-bit value
pub fn combine_u32(msw: u16, lsw: u16) -> u32 {
    ((msw as u32) << 16) | lsw as u32
}

/// Offsets of one phase's registers; 32-bit values point at the low word
struct PhaseLayout {
    energy: usize,
    power: usize,
    reactive_energy: usize,
    reactive_power: usize,
    apparent_energy: usize,
    apparent_power: usize,
    displacement_pf: usize,
    apparent_pf: usize,
    current: usize,
    voltage_ln: usize,
}

const PHASE_LAYOUTS: [PhaseLayout; 3] = [
    PhaseLayout {
        energy: 22,
        power: 28,
        reactive_energy: 31,
        reactive_power: 37,
        apparent_energy: 40,
        apparent_power: 46,
        displacement_pf: 49,
        apparent_pf: 52,
        current: 55,
        voltage_ln: 58,
    },
    PhaseLayout {
        energy: 24,
        power: 29,
        reactive_energy: 33,
        reactive_power: 38,
        apparent_energy: 42,
        apparent_power: 47,
        displacement_pf: 50,
        apparent_pf: 53,
        current: 56,
        voltage_ln: 59,
    },
    PhaseLayout {
        energy: 26,
        power: 30,
        reactive_energy: 35,
        reactive_power: 39,
        apparent_energy: 44,
        apparent_power: 48,
        displacement_pf: 51,
        apparent_pf: 54,
        current: 57,
        voltage_ln: 60,
    },
];

/// Register block plus the multipliers to apply to it
struct Block<'a> {
    regs: &'a [u16],
    m: &'a MultiplierSet,
}

impl Block<'_> {
    fn raw(&self, i: usize) -> u16 {
        self.regs[i]
    }

    fn wide(&self, lsw: usize) -> u32 {
        combine_u32(self.regs[lsw + 1], self.regs[lsw])
    }

    fn energy(&self, lsw: usize) -> f64 {
        self.wide(lsw) as f64 * self.m.power
    }

    fn power(&self, i: usize) -> f64 {
        self.regs[i] as f64 * self.m.power
    }

    fn pf(&self, i: usize) -> f64 {
        self.regs[i] as f64 * self.m.pf
    }

    fn current(&self, i: usize) -> f64 {
        self.regs[i] as f64 * self.m.current
    }

    fn voltage(&self, i: usize) -> f64 {
        self.regs[i] as f64 * self.m.voltage
    }

    fn frequency(&self, i: usize) -> f64 {
        self.regs[i] as f64 * self.m.frequency
    }

    fn phase(&self, l: &PhaseLayout) -> PhaseValues {
        PhaseValues {
            energy_kwh: self.energy(l.energy),
            power_kw: self.power(l.power),
            reactive_energy_kvarh: self.energy(l.reactive_energy),
            reactive_power_kvar: self.power(l.reactive_power),
            apparent_energy_kvah: self.energy(l.apparent_energy),
            apparent_power_kva: self.power(l.apparent_power),
            displacement_pf: self.pf(l.displacement_pf),
            apparent_pf: self.pf(l.apparent_pf),
            current: self.current(l.current),
            voltage_ln: self.voltage(l.voltage_ln),
        }
    }
}

fn require(layout: &'static str, registers: &[u16], required: u16) -> Result<(), DecodeError> {
    if registers.len() < required as usize {
        return Err(DecodeError {
            layout,
            required: required as usize,
            received: registers.len(),
        });
    }
    Ok(())
}

/// Decode the 22-register basic block
pub fn decode_basic(
    registers: &[u16],
    data_scalar: u16,
    multipliers: MultiplierSet,
    timestamp: DateTime<Utc>,
) -> Result<BasicReading, DecodeError> {
    require("basic", registers, BASIC_BLOCK_LEN)?;
    let b = Block {
        regs: registers,
        m: &multipliers,
    };

    Ok(BasicReading {
        timestamp,
        energy_kwh: b.energy(0),
        power_kw: b.power(2),
        reactive_power_kvar: b.power(9),
        apparent_power_kva: b.power(12),
        power_factor: b.pf(13),
        current_avg: b.current(15),
        voltage_ll_avg: b.voltage(16),
        voltage_ln_avg: b.voltage(17),
        frequency: b.frequency(21),
        data_scalar,
        raw_values: BasicRawValues {
            frequency: b.raw(21),
            voltage_ll: b.raw(16),
            voltage_ln: b.raw(17),
            current: b.raw(15),
            power: b.raw(2),
            pf: b.raw(13),
        },
        multipliers,
        corrections: Vec::new(),
    })
}

/// Decode the 64-register detailed block
pub fn decode_detailed(
    registers: &[u16],
    data_scalar: u16,
    multipliers: MultiplierSet,
    timestamp: DateTime<Utc>,
) -> Result<DetailedReading, DecodeError> {
    require("detailed", registers, DETAILED_BLOCK_LEN)?;
    let b = Block {
        regs: registers,
        m: &multipliers,
    };

    let [l1, l2, l3] = &PHASE_LAYOUTS;
    let mut phase_3 = b.phase(l3);
    let mut corrections = Vec::new();
    if let Some(c) = phase3_power_overflow(&mut phase_3.power_kw) {
        corrections.push(c);
    }

    Ok(DetailedReading {
        timestamp,
        data_scalar,
        multipliers,
        system: SystemValues {
            energy_kwh: b.energy(0),
            power_kw: b.power(2),
            demand_kw_max: b.power(3),
            demand_kw_now: b.power(4),
            power_kw_max: b.power(5),
            power_kw_min: b.power(6),
            reactive_energy_kvarh: b.energy(7),
            reactive_power_kvar: b.power(9),
            apparent_energy_kvah: b.energy(10),
            apparent_power_kva: b.power(12),
            displacement_pf: b.pf(13),
            apparent_pf: b.pf(14),
            current_avg: b.current(15),
            voltage_ll_avg: b.voltage(16),
            voltage_ln_avg: b.voltage(17),
        },
        voltages: InterPhaseVoltages {
            l1_l2: b.voltage(18),
            l2_l3: b.voltage(19),
            l1_l3: b.voltage(20),
        },
        frequency: b.frequency(21),
        raw_values: DetailedRawValues {
            frequency: b.raw(21),
            voltage_ll_avg: b.raw(16),
            voltage_ln_avg: b.raw(17),
            current_avg: b.raw(15),
            power: b.raw(2),
            pf: b.raw(13),
            data_scalar,
        },
        phase_1: b.phase(l1),
        phase_2: b.phase(l2),
        phase_3,
        time_since_reset: b.wide(61),
        data_tick_counter: b.raw(63),
        corrections,
    })
}

/// Phase 3 power register overflow on some firmware: a scaled value at or
/// above [`PHASE3_POWER_OVERFLOW_KW`] is divided by 10
fn phase3_power_overflow(power_kw: &mut f64) -> Option<Correction> {
    if *power_kw < PHASE3_POWER_OVERFLOW_KW {
        return None;
    }
    let before = *power_kw;
    *power_kw = before / 10.0;
    warn!(
        "phase_3.power_kw = {} at or above {}, divided by 10",
        before, PHASE3_POWER_OVERFLOW_KW
    );
    Some(Correction {
        kind: CorrectionKind::Phase3PowerOverflow,
        field: "phase_3.power_kw".to_string(),
        before,
        after: *power_kw,
    })
}
