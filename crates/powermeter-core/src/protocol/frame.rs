//! Request frame construction
//!
//! Frame format (Modbus RTU):
//! - 1 byte: device address
//! - 1 byte: function code
//! - N bytes: payload (big-endian fields)
//! - 2 bytes: CRC-16 of everything before it, low byte first
//!
//! Register addresses are accepted in the "4xxxx" convention. Anything at or
//! above 40001 is converted to a zero-based wire address before encoding.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{crc::append_crc, ProtocolError, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

/// First logical address of the holding register space
pub const LOGICAL_BASE: u16 = 40001;

/// Bit set in the function code of an exception reply
pub const EXCEPTION_BIT: u8 = 0x80;

/// Function codes used by the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionCode {
    /// 0x03
    ReadHoldingRegisters,
    /// 0x04, answered in the same layout as 0x03
    ReadInputRegisters,
    /// 0x06
    WriteSingleRegister,
    /// 0x10
    WriteMultipleRegisters,
}

impl FunctionCode {
    /// Wire value of the function code
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 3,
            FunctionCode::ReadInputRegisters => 4,
            FunctionCode::WriteSingleRegister => 6,
            FunctionCode::WriteMultipleRegisters => 16,
        }
    }

    /// Look up a function code by wire value
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            3 => Some(FunctionCode::ReadHoldingRegisters),
            4 => Some(FunctionCode::ReadInputRegisters),
            6 => Some(FunctionCode::WriteSingleRegister),
            16 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// True for the register read functions
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        )
    }
}

/// Convert a logical "4xxxx" register address to its wire address
pub fn wire_address(logical: u16) -> u16 {
    if logical >= LOGICAL_BASE {
        logical - LOGICAL_BASE
    } else {
        logical
    }
}

/// Byte-level builder for RTU frames
pub struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame for `device_address` and `function`
    pub fn new(device_address: u8, function: u8) -> Self {
        let mut bytes = Vec::with_capacity(16);
        bytes.push(device_address);
        bytes.push(function);
        Self { bytes }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.bytes.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.bytes.extend_from_slice(&buf);
        self
    }

    /// Add a run of 16-bit values (big-endian)
    pub fn words(self, values: &[u16]) -> Self {
        values.iter().fold(self, |b, &v| b.u16_be(v))
    }

    /// Terminate the frame with its CRC
    pub fn build(mut self) -> Vec<u8> {
        append_crc(&mut self.bytes);
        self.bytes
    }
}

fn check_device_address(device_address: u8) -> Result<(), ProtocolError> {
    if (1..=247).contains(&device_address) {
        Ok(())
    } else {
        Err(ProtocolError::Configuration(format!(
            "device address {} outside 1-247",
            device_address
        )))
    }
}

fn check_count(count: u16, max: u16) -> Result<(), ProtocolError> {
    if count == 0 || count > max {
        return Err(ProtocolError::Configuration(format!(
            "register count {} outside 1-{}",
            count, max
        )));
    }
    Ok(())
}

/// Build a complete request frame.
///
/// * reads (3/4): start address + count
/// * write single (6): address + value, zero when no value is given
/// * write multiple (16): address + count + byte count + values, zero-filled
///   when no values are given
pub fn build_command(
    device_address: u8,
    function: FunctionCode,
    register_address: u16,
    register_count: u16,
    register_values: Option<&[u16]>,
) -> Result<Vec<u8>, ProtocolError> {
    check_device_address(device_address)?;

    let address = wire_address(register_address);
    debug!(
        "Register {} -> wire address {} ({:#06x})",
        register_address, address, address
    );

    let builder = FrameBuilder::new(device_address, function.code()).u16_be(address);
    let values = register_values.unwrap_or(&[]);

    let frame = match function {
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            check_count(register_count, MAX_READ_REGISTERS)?;
            builder.u16_be(register_count).build()
        }
        FunctionCode::WriteSingleRegister => {
            if values.len() > 1 {
                return Err(ProtocolError::Configuration(format!(
                    "write single register given {} values",
                    values.len()
                )));
            }
            builder.u16_be(values.first().copied().unwrap_or(0)).build()
        }
        FunctionCode::WriteMultipleRegisters => {
            check_count(register_count, MAX_WRITE_REGISTERS)?;
            let zeros;
            let values = if values.is_empty() {
                zeros = vec![0u16; register_count as usize];
                zeros.as_slice()
            } else if values.len() == register_count as usize {
                values
            } else {
                return Err(ProtocolError::Configuration(format!(
                    "register count {} does not match {} values",
                    register_count,
                    values.len()
                )));
            };
            builder
                .u16_be(register_count)
                .byte((register_count * 2) as u8)
                .words(values)
                .build()
        }
    };

    debug!("Complete command: {:02x?}", frame);
    Ok(frame)
}

/// Build a register read request (function 3)
pub fn read_request(
    device_address: u8,
    register_address: u16,
    count: u16,
) -> Result<Vec<u8>, ProtocolError> {
    build_command(
        device_address,
        FunctionCode::ReadHoldingRegisters,
        register_address,
        count,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::verify_crc;

    #[test]
    fn test_logical_address_conversion() {
        assert_eq!(wire_address(44001), 4000);
        assert_eq!(wire_address(40001), 0);
        assert_eq!(wire_address(40000), 40000);
        assert_eq!(wire_address(12), 12);
    }

    #[test]
    fn test_read_request_layout() {
        let frame = read_request(1, 44001, 22).unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x0F, 0xA0, 0x00, 0x16, 0xC7, 0x32]);
    }

    #[test]
    fn test_write_single_defaults_to_zero() {
        let frame =
            build_command(1, FunctionCode::WriteSingleRegister, 44603, 1, None).unwrap();
        assert_eq!(&frame[..6], &[0x01, 0x06, 0x11, 0xFA, 0x00, 0x00]);
        assert!(verify_crc(&frame).is_ok());
    }

    #[test]
    fn test_write_multiple_layout() {
        let frame = build_command(
            2,
            FunctionCode::WriteMultipleRegisters,
            10,
            2,
            Some(&[0x0102, 0xA0B0]),
        )
        .unwrap();
        assert_eq!(
            &frame[..frame.len() - 2],
            &[0x02, 0x10, 0x00, 0x0A, 0x00, 0x02, 0x04, 0x01, 0x02, 0xA0, 0xB0]
        );
        assert!(verify_crc(&frame).is_ok());
    }

    #[test]
    fn test_write_multiple_zero_fill() {
        let frame =
            build_command(1, FunctionCode::WriteMultipleRegisters, 0, 3, None).unwrap();
        // header(2) + addr(2) + count(2) + byte count(1) + 6 data + crc(2)
        assert_eq!(frame.len(), 15);
        assert_eq!(frame[6], 6);
        assert!(frame[7..13].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejects_malformed_parameters() {
        assert!(read_request(0, 44001, 1).is_err());
        assert!(read_request(248, 44001, 1).is_err());
        assert!(read_request(1, 44001, 0).is_err());
        assert!(read_request(1, 44001, 126).is_err());
        assert!(build_command(
            1,
            FunctionCode::WriteMultipleRegisters,
            0,
            3,
            Some(&[1, 2])
        )
        .is_err());
        assert!(
            build_command(1, FunctionCode::WriteSingleRegister, 0, 1, Some(&[1, 2])).is_err()
        );
    }

    #[test]
    fn test_function_code_roundtrip() {
        for code in [3u8, 4, 6, 16] {
            let f = FunctionCode::from_code(code).unwrap();
            assert_eq!(f.code(), code);
        }
        assert!(FunctionCode::from_code(5).is_none());
    }
}
