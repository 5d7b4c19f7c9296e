//! Protocol errors

use thiserror::Error;

/// Errors raised by the serial link while exchanging frames
#[derive(Error, Debug)]
pub enum TransportError {
    /// Port-level failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Port could not be opened
    #[error("Failed to open {port}: {reason}")]
    ConnectionFailed {
        /// Port name
        port: String,
        /// Driver message
        reason: String,
    },

    /// No link is open
    #[error("Not connected to meter")]
    NotConnected,

    /// Frame could not be written
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Nothing arrived before the deadline
    #[error("No response within {timeout_ms}ms (expected {expected} bytes)")]
    Timeout {
        /// Bytes the reply should have had
        expected: usize,
        /// Deadline that passed
        timeout_ms: u64,
    },

    /// Another caller panicked mid-exchange
    #[error("Transport lock poisoned by a panicked caller")]
    LockPoisoned,

    /// Read failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Structural problems with a response frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Too short to hold address, function and CRC
    #[error("Short response: {len} bytes")]
    ShortResponse {
        /// Bytes received
        len: usize,
    },

    /// Declared byte count runs past the frame
    #[error("Byte count {declared} does not fit in a {len}-byte response")]
    ByteCountMismatch {
        /// Byte count field
        declared: usize,
        /// Frame length
        len: usize,
    },

    /// Fewer or more registers than requested
    #[error("Register count mismatch: requested {requested}, received {received}")]
    RegisterCountMismatch {
        /// Registers asked for
        requested: u16,
        /// Registers in the reply
        received: usize,
    },

    /// Reply CRC does not match its contents
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC computed over the reply
        expected: u16,
        /// CRC carried by the reply
        actual: u16,
    },

    /// Reply is for a different function
    #[error("Reply function {actual:#04x} does not answer request function {expected:#04x}")]
    UnexpectedFunction {
        /// Request function code
        expected: u8,
        /// Reply function code
        actual: u8,
    },

    /// Write reply does not echo the request
    #[error("Write echo mismatch at address {address}")]
    EchoMismatch {
        /// Logical address written
        address: u16,
    },
}

/// A Modbus exception reply reported by the device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Modbus exception {code} ({}) for function {function:#04x}", code_message(.code))]
pub struct ExceptionResponse {
    /// Responding device address
    pub device_address: u8,
    /// Function code as sent, with the exception bit cleared
    pub function: u8,
    /// Exception code (third byte of the reply)
    pub code: u8,
}

impl ExceptionResponse {
    /// Canonical message for this exception code
    pub fn message(&self) -> &'static str {
        exception_message(self.code)
    }
}

fn code_message(code: &u8) -> &'static str {
    exception_message(*code)
}

/// Map a Modbus exception code to its canonical message
pub fn exception_message(code: u8) -> &'static str {
    match code {
        1 => "Illegal Function",
        2 => "Illegal Data Address",
        3 => "Illegal Data Value",
        4 => "Slave Device Failure",
        5 => "Acknowledge",
        6 => "Slave Device Busy",
        8 => "Memory Parity Error",
        10 => "Gateway Path Unavailable",
        11 => "Gateway Target Device Failed to Respond",
        _ => "Unknown Error",
    }
}

/// Errors that can occur during a Modbus exchange
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Link failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed reply
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Device answered with an exception
    #[error(transparent)]
    Exception(#[from] ExceptionResponse),

    /// Request could not be built
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_messages() {
        assert_eq!(exception_message(2), "Illegal Data Address");
        assert_eq!(exception_message(11), "Gateway Target Device Failed to Respond");
        assert_eq!(exception_message(7), "Unknown Error");
        assert_eq!(exception_message(9), "Unknown Error");
    }

    #[test]
    fn test_exception_display() {
        let err = ExceptionResponse {
            device_address: 1,
            function: 3,
            code: 2,
        };
        assert_eq!(
            err.to_string(),
            "Modbus exception 2 (Illegal Data Address) for function 0x03"
        );
    }
}
