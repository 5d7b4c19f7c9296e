//! Response frame parsing
//!
//! A response is decoded against the command that produced it. The trailing
//! CRC is checked before anything else is looked at; exception replies are
//! surfaced as [`ExceptionResponse`] errors so they can never be mistaken for
//! register data.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use super::{
    crc::verify_crc, ExceptionResponse, FrameError, FunctionCode, ProtocolError, EXCEPTION_BIT,
};

/// Smallest well-formed reply: address, function, one payload byte and CRC
pub const MIN_RESPONSE_LEN: usize = 5;

/// A decoded, successful response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// Reply to function 3 or 4
    Registers {
        /// Responding device
        device_address: u8,
        /// 3 or 4
        function: u8,
        /// Wire start address taken from the request, if it carried one
        start_address: Option<u16>,
        /// Data bytes that followed
        byte_count: u8,
        /// Register values in order
        values: Vec<u16>,
    },
    /// Echo of a function 6 request
    WriteSingle {
        /// Responding device
        device_address: u8,
        /// Wire address written
        address: u16,
        /// Value written
        value: u16,
    },
    /// Echo of a function 16 request
    WriteMultiple {
        /// Responding device
        device_address: u8,
        /// Wire start address
        address: u16,
        /// Registers written
        count: u16,
    },
    /// Any other function code; payload excludes address, function and CRC
    Other {
        /// Responding device
        device_address: u8,
        /// Function code of the reply
        function: u8,
        /// Bytes between function code and CRC
        payload: Vec<u8>,
    },
}

impl Response {
    /// Register values, if this is a read reply
    pub fn registers(&self) -> Option<&[u16]> {
        match self {
            Response::Registers { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Address of the responding device
    pub fn device_address(&self) -> u8 {
        match self {
            Response::Registers { device_address, .. }
            | Response::WriteSingle { device_address, .. }
            | Response::WriteMultiple { device_address, .. }
            | Response::Other { device_address, .. } => *device_address,
        }
    }
}

/// Parse `response` as the reply to `command`
pub fn parse_response(command: &[u8], response: &[u8]) -> Result<Response, ProtocolError> {
    if response.len() < MIN_RESPONSE_LEN {
        return Err(FrameError::ShortResponse {
            len: response.len(),
        }
        .into());
    }

    if let Err((expected, actual)) = verify_crc(response) {
        return Err(FrameError::CrcMismatch { expected, actual }.into());
    }

    let device_address = response[0];
    let function = response[1];

    if function & EXCEPTION_BIT != 0 {
        return Err(ExceptionResponse {
            device_address,
            function: function & !EXCEPTION_BIT,
            code: response[2],
        }
        .into());
    }

    if let Some(&requested) = command.get(1) {
        if requested != function {
            return Err(FrameError::UnexpectedFunction {
                expected: requested,
                actual: function,
            }
            .into());
        }
    }

    // Everything between the function code and the CRC
    let body = &response[2..response.len() - 2];

    match FunctionCode::from_code(function) {
        Some(f) if f.is_read() => parse_registers(command, device_address, function, body),
        Some(FunctionCode::WriteSingleRegister) => {
            let (address, value) = echo_pair(body, response.len())?;
            Ok(Response::WriteSingle {
                device_address,
                address,
                value,
            })
        }
        Some(FunctionCode::WriteMultipleRegisters) => {
            let (address, count) = echo_pair(body, response.len())?;
            Ok(Response::WriteMultiple {
                device_address,
                address,
                count,
            })
        }
        _ => Ok(Response::Other {
            device_address,
            function,
            payload: body.to_vec(),
        }),
    }
}

fn parse_registers(
    command: &[u8],
    device_address: u8,
    function: u8,
    body: &[u8],
) -> Result<Response, ProtocolError> {
    let byte_count = body.first().copied().unwrap_or(0);
    let data = body.get(1..).unwrap_or(&[]);
    if data.len() != byte_count as usize || byte_count % 2 != 0 {
        return Err(FrameError::ByteCountMismatch {
            declared: byte_count as usize,
            len: body.len() + 4,
        }
        .into());
    }

    let values: Vec<u16> = data.chunks_exact(2).map(BigEndian::read_u16).collect();

    if command.len() >= 6 {
        let requested = BigEndian::read_u16(&command[4..6]);
        if requested as usize != values.len() {
            return Err(FrameError::RegisterCountMismatch {
                requested,
                received: values.len(),
            }
            .into());
        }
    }

    let start_address = command.get(2..4).map(BigEndian::read_u16);

    Ok(Response::Registers {
        device_address,
        function,
        start_address,
        byte_count,
        values,
    })
}

fn echo_pair(body: &[u8], len: usize) -> Result<(u16, u16), ProtocolError> {
    if body.len() < 4 {
        return Err(FrameError::ShortResponse { len }.into());
    }
    Ok((
        BigEndian::read_u16(&body[0..2]),
        BigEndian::read_u16(&body[2..4]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::append_crc;
    use crate::protocol::frame::read_request;

    fn framed(bytes: &[u8]) -> Vec<u8> {
        let mut v = bytes.to_vec();
        append_crc(&mut v);
        v
    }

    #[test]
    fn test_parse_register_reply() {
        let cmd = read_request(1, 44001, 2).unwrap();
        let resp = framed(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x13, 0x88]);
        let parsed = parse_response(&cmd, &resp).unwrap();
        assert_eq!(parsed.registers(), Some(&[1u16, 5000][..]));
        match parsed {
            Response::Registers {
                start_address,
                byte_count,
                ..
            } => {
                assert_eq!(start_address, Some(4000));
                assert_eq!(byte_count, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_response() {
        let cmd = read_request(1, 44001, 1).unwrap();
        let err = parse_response(&cmd, &[0x01, 0x03]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Frame(FrameError::ShortResponse { len: 2 })
        ));
    }

    #[test]
    fn test_exception_reply_is_never_register_data() {
        let cmd = read_request(1, 44001, 1).unwrap();
        let resp = framed(&[0x01, 0x83, 0x02]);
        match parse_response(&cmd, &resp) {
            Err(ProtocolError::Exception(e)) => {
                assert_eq!(e.function, 3);
                assert_eq!(e.code, 2);
                assert_eq!(e.message(), "Illegal Data Address");
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_exception_code() {
        let resp = framed(&[0x01, 0x90, 0x42]);
        match parse_response(&[], &resp) {
            Err(ProtocolError::Exception(e)) => assert_eq!(e.message(), "Unknown Error"),
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let cmd = read_request(1, 44001, 1).unwrap();
        let mut resp = framed(&[0x01, 0x03, 0x02, 0x00, 0x07]);
        resp[4] ^= 0x01;
        assert!(matches!(
            parse_response(&cmd, &resp),
            Err(ProtocolError::Frame(FrameError::CrcMismatch { .. }))
        ));
    }

    #[test]
    fn test_byte_count_mismatch() {
        let cmd = read_request(1, 44001, 2).unwrap();
        // declares 4 data bytes, carries 2
        let resp = framed(&[0x01, 0x03, 0x04, 0x00, 0x07]);
        assert!(matches!(
            parse_response(&cmd, &resp),
            Err(ProtocolError::Frame(FrameError::ByteCountMismatch { .. }))
        ));
    }

    #[test]
    fn test_register_count_mismatch() {
        let cmd = read_request(1, 44001, 2).unwrap();
        let resp = framed(&[0x01, 0x03, 0x02, 0x00, 0x07]);
        assert!(matches!(
            parse_response(&cmd, &resp),
            Err(ProtocolError::Frame(FrameError::RegisterCountMismatch {
                requested: 2,
                received: 1
            }))
        ));
    }

    #[test]
    fn test_write_echoes() {
        let single = framed(&[0x01, 0x06, 0x11, 0xFA, 0x00, 0x0F]);
        assert_eq!(
            parse_response(&[0x01, 0x06], &single).unwrap(),
            Response::WriteSingle {
                device_address: 1,
                address: 0x11FA,
                value: 15
            }
        );

        let multiple = framed(&[0x01, 0x10, 0x00, 0x0A, 0x00, 0x02]);
        assert_eq!(
            parse_response(&[0x01, 0x10], &multiple).unwrap(),
            Response::WriteMultiple {
                device_address: 1,
                address: 10,
                count: 2
            }
        );
    }

    #[test]
    fn test_function_mismatch() {
        let cmd = read_request(1, 44001, 1).unwrap();
        let resp = framed(&[0x01, 0x04, 0x02, 0x00, 0x07]);
        assert!(matches!(
            parse_response(&cmd, &resp),
            Err(ProtocolError::Frame(FrameError::UnexpectedFunction {
                expected: 3,
                actual: 4
            }))
        ));
    }
}
