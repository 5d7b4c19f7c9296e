//! Modbus CRC-16
//!
//! Reflected polynomial 0xA001, initial value 0xFFFF. The checksum is
//! transmitted low byte first.

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;

/// Calculate the Modbus CRC-16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC-16 of `data` as it appears on the wire (low byte first)
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_le_bytes()
}

/// Append the CRC of everything already in `frame`
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_bytes(frame);
    frame.extend_from_slice(&crc);
}

/// Check the trailing two bytes of `frame` against the CRC of the rest.
///
/// Returns `(expected, actual)` on mismatch. Frames shorter than three bytes
/// never verify.
pub fn verify_crc(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 3 {
        return Err((0, 0));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([tail[0], tail[1]]);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}
