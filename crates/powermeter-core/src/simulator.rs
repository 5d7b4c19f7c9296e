//! Simulated power meter
//!
//! A [`SerialLink`] that answers Modbus RTU requests the way the real meter
//! does, so the whole stack can run without hardware. Simulates a three-phase
//! load of roughly 173 kW per phase at 265 V line-to-neutral, with a little
//! per-phase jitter on every read and an energy counter that keeps rising.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Instant;
use tracing::{debug, info};

use crate::meter::{multipliers_for, registers};
use crate::protocol::{
    crc::{append_crc, verify_crc},
    serial::SerialLink,
    wire_address, FunctionCode, SerialSettings, Transport, EXCEPTION_BIT, MAX_READ_REGISTERS,
};

/// Exception code for an unsupported function
const ILLEGAL_FUNCTION: u8 = 1;
/// Exception code for an address outside the register map
const ILLEGAL_DATA_ADDRESS: u8 = 2;
/// Exception code for a malformed request body
const ILLEGAL_DATA_VALUE: u8 = 3;

const SIMULATED_SCALAR: u16 = 3;
const START_ENERGY_KWH: f64 = 1_000_000.0;
const VOLTAGE_LN: f64 = 265.0;
const PHASE_POWER_KW: f64 = 173.0;
const POWER_FACTOR: f64 = 0.99;
const FREQUENCY_HZ: f64 = 60.0;

/// Simulated meter answering on one device address
pub struct SimulatedMeter {
    device_address: u8,
    rng: StdRng,
    started: Instant,
    last_sample: Instant,
    energy_kwh: f64,
    ticks: u16,
    /// Writable configuration registers, by wire address
    config_registers: HashMap<u16, u16>,
    pending: VecDeque<u8>,
}

impl SimulatedMeter {
    /// Simulated meter seeded from system entropy
    pub fn new(device_address: u8) -> Self {
        Self::with_rng(device_address, StdRng::from_entropy())
    }

    /// Simulated meter with reproducible jitter
    pub fn with_seed(device_address: u8, seed: u64) -> Self {
        Self::with_rng(device_address, StdRng::seed_from_u64(seed))
    }

    fn with_rng(device_address: u8, rng: StdRng) -> Self {
        let mut config_registers = HashMap::new();
        config_registers.insert(wire_address(registers::DATA_SCALAR), SIMULATED_SCALAR);
        config_registers.insert(wire_address(registers::DEMAND_WINDOW_SIZE), 15);

        let now = Instant::now();
        Self {
            device_address,
            rng,
            started: now,
            last_sample: now,
            energy_kwh: START_ENERGY_KWH,
            ticks: 0,
            config_registers,
            pending: VecDeque::new(),
        }
    }

    /// Transport whose every connection opens a fresh simulated meter
    pub fn transport(device_address: u8) -> Transport {
        info!("Using simulated power meter at address {}", device_address);
        Transport::with_opener(
            SerialSettings::for_port("simulated"),
            Box::new(move |_: &SerialSettings| {
                Ok(Box::new(SimulatedMeter::new(device_address)) as Box<dyn SerialLink>)
            }),
        )
    }

    fn scalar(&self) -> u16 {
        self.config_registers
            .get(&wire_address(registers::DATA_SCALAR))
            .copied()
            .unwrap_or(SIMULATED_SCALAR)
    }

    /// Fresh values for the 64-register measurement block
    fn sample_block(&mut self) -> [u16; 64] {
        let m = multipliers_for(self.scalar(), None);
        let rng = &mut self.rng;

        let current_base = rng.gen_range(650.0..660.0);
        let variations = [
            rng.gen_range(0.98..1.02),
            rng.gen_range(0.97..1.03),
            rng.gen_range(0.96..1.04),
        ];
        let frequency = FREQUENCY_HZ + rng.gen_range(-0.1..0.1);

        let now = Instant::now();
        let hours = now.duration_since(self.last_sample).as_secs_f64() / 3600.0;
        self.last_sample = now;
        self.ticks = self.ticks.wrapping_add(1);

        let mut block = [0u16; 64];
        let mut total_kw = 0.0;
        let mut total_kvar = 0.0;
        let mut total_kva = 0.0;
        let mut current_sum = 0.0;
        let mut voltage_sum = 0.0;

        for (n, var) in variations.iter().enumerate() {
            let voltage = VOLTAGE_LN * var;
            let current = current_base * var;
            let kw = PHASE_POWER_KW * var;
            let kva = kw / POWER_FACTOR;
            let kvar = (kva * kva - kw * kw).sqrt();
            let energy = self.energy_kwh / 3.0;

            put_wide(&mut block, 22 + 2 * n, energy, m.power);
            block[28 + n] = raw(kw, m.power);
            put_wide(&mut block, 31 + 2 * n, energy * 0.15, m.power);
            block[37 + n] = raw(kvar, m.power);
            put_wide(&mut block, 40 + 2 * n, energy * 1.01, m.power);
            block[46 + n] = raw(kva, m.power);
            block[49 + n] = raw(POWER_FACTOR, m.pf);
            block[52 + n] = raw(POWER_FACTOR, m.pf);
            block[55 + n] = raw(current, m.current);
            block[58 + n] = raw(voltage, m.voltage);

            total_kw += kw;
            total_kvar += kvar;
            total_kva += kva;
            current_sum += current;
            voltage_sum += voltage;
        }

        self.energy_kwh += total_kw * hours;
        let voltage_ln = voltage_sum / 3.0;
        let voltage_ll = voltage_ln * 3f64.sqrt();

        put_wide(&mut block, 0, self.energy_kwh, m.power);
        block[2] = raw(total_kw, m.power);
        block[3] = raw(total_kw * 1.2, m.power);
        block[4] = raw(total_kw, m.power);
        block[5] = raw(total_kw * 1.3, m.power);
        block[6] = raw(total_kw * 0.7, m.power);
        put_wide(&mut block, 7, self.energy_kwh * 0.15, m.power);
        block[9] = raw(total_kvar, m.power);
        put_wide(&mut block, 10, self.energy_kwh * 1.01, m.power);
        block[12] = raw(total_kva, m.power);
        block[13] = raw(POWER_FACTOR, m.pf);
        block[14] = raw(POWER_FACTOR, m.pf);
        block[15] = raw(current_sum / 3.0, m.current);
        block[16] = raw(voltage_ll, m.voltage);
        block[17] = raw(voltage_ln, m.voltage);
        block[18] = raw(voltage_ll * 0.99, m.voltage);
        block[19] = raw(voltage_ll * 1.01, m.voltage);
        block[20] = raw(voltage_ll, m.voltage);
        block[21] = raw(frequency, m.frequency);

        let uptime = self.started.elapsed().as_secs() as u32;
        block[61] = (uptime & 0xFFFF) as u16;
        block[62] = (uptime >> 16) as u16;
        block[63] = self.ticks;
        block
    }

    /// Value of one register, `None` if the address is outside the map
    fn register(&self, block: &[u16; 64], wire: u16) -> Option<u16> {
        let base = wire_address(registers::BLOCK_START);
        match wire.checked_sub(base) {
            Some(offset) if (offset as usize) < block.len() => Some(block[offset as usize]),
            _ => self.config_registers.get(&wire).copied(),
        }
    }

    /// Build the reply to one complete request frame
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 4 || verify_crc(request).is_err() {
            debug!("Simulator: dropping corrupt request {:02x?}", request);
            return None;
        }
        if request[0] != self.device_address {
            return None;
        }

        let function = request[1];
        let body = &request[2..request.len() - 2];
        let reply = match FunctionCode::from_code(function) {
            Some(f) if f.is_read() => self.read_reply(function, body),
            Some(FunctionCode::WriteSingleRegister) => self.write_single_reply(body),
            _ => Err(ILLEGAL_FUNCTION),
        };

        let mut frame = vec![self.device_address];
        match reply {
            Ok(payload) => {
                frame.push(function);
                frame.extend_from_slice(&payload);
            }
            Err(code) => {
                frame.push(function | EXCEPTION_BIT);
                frame.push(code);
            }
        }
        append_crc(&mut frame);
        Some(frame)
    }

    fn read_reply(&mut self, function: u8, body: &[u8]) -> Result<Vec<u8>, u8> {
        let (start, count) = pair(body).ok_or(ILLEGAL_DATA_VALUE)?;
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ILLEGAL_DATA_VALUE);
        }
        let block = self.sample_block();

        let mut payload = vec![(count * 2) as u8];
        for wire in start..start.saturating_add(count) {
            let value = self.register(&block, wire).ok_or(ILLEGAL_DATA_ADDRESS)?;
            payload.extend_from_slice(&value.to_be_bytes());
        }
        debug!(
            "Simulator: function {} read {} registers at {}",
            function, count, start
        );
        Ok(payload)
    }

    fn write_single_reply(&mut self, body: &[u8]) -> Result<Vec<u8>, u8> {
        let (address, value) = pair(body).ok_or(ILLEGAL_DATA_VALUE)?;
        let slot = self
            .config_registers
            .get_mut(&address)
            .ok_or(ILLEGAL_DATA_ADDRESS)?;
        *slot = value;
        Ok(body[..4].to_vec())
    }
}

impl SerialLink for SimulatedMeter {
    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(reply) = self.respond(data) {
            self.pending.extend(reply);
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// First two big-endian words of a request body
fn pair(body: &[u8]) -> Option<(u16, u16)> {
    let words = body.get(..4)?;
    Some((
        u16::from_be_bytes([words[0], words[1]]),
        u16::from_be_bytes([words[2], words[3]]),
    ))
}

/// Engineering value to raw register value, saturating at the register range
fn raw(value: f64, multiplier: f64) -> u16 {
    (value / multiplier).round().clamp(0.0, u16::MAX as f64) as u16
}

/// Store a 32-bit raw value low word first
fn put_wide(block: &mut [u16; 64], lsw: usize, value: f64, multiplier: f64) {
    let raw = (value / multiplier).round().clamp(0.0, u32::MAX as f64) as u32;
    block[lsw] = (raw & 0xFFFF) as u16;
    block[lsw + 1] = (raw >> 16) as u16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_command, frame::read_request};

    fn exchange(meter: &mut SimulatedMeter, request: &[u8]) -> Vec<u8> {
        meter.write_frame(request).unwrap();
        let mut buf = [0u8; 256];
        let n = meter.read_available(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_scalar_register() {
        let mut meter = SimulatedMeter::with_seed(1, 7);
        let reply = exchange(&mut meter, &read_request(1, 44602, 1).unwrap());
        assert_eq!(&reply[..5], &[1, 3, 2, 0, 3]);
        assert!(verify_crc(&reply).is_ok());
    }

    #[test]
    fn test_unknown_address_is_exception_2() {
        let mut meter = SimulatedMeter::with_seed(1, 7);
        let reply = exchange(&mut meter, &read_request(1, 45000, 1).unwrap());
        assert_eq!(&reply[..3], &[1, 0x83, 2]);
    }

    #[test]
    fn test_unsupported_function_is_exception_1() {
        let mut meter = SimulatedMeter::with_seed(1, 7);
        let mut request = vec![1, 0x2B, 0x0E, 0x01];
        append_crc(&mut request);
        let reply = exchange(&mut meter, &request);
        assert_eq!(&reply[..3], &[1, 0xAB, 1]);
    }

    #[test]
    fn test_other_address_is_silent() {
        let mut meter = SimulatedMeter::with_seed(1, 7);
        assert!(exchange(&mut meter, &read_request(2, 44001, 1).unwrap()).is_empty());
    }

    #[test]
    fn test_write_demand_window() {
        let mut meter = SimulatedMeter::with_seed(1, 7);
        let request =
            build_command(1, FunctionCode::WriteSingleRegister, 44603, 1, Some(&[30])).unwrap();
        let reply = exchange(&mut meter, &request);
        assert_eq!(reply, request);
        let read = exchange(&mut meter, &read_request(1, 44603, 1).unwrap());
        assert_eq!(&read[3..5], &[0, 30]);
    }

    #[test]
    fn test_frequency_raw_value() {
        let mut meter = SimulatedMeter::with_seed(1, 7);
        let block = meter.sample_block();
        assert!((11_980..=12_020).contains(&block[21]), "raw {}", block[21]);
    }
}
