//! Modbus RTU Communication
//!
//! Implements the master side of Modbus RTU over a serial line: CRC-16,
//! request framing, response parsing and a transport that keeps exactly one
//! frame in flight.

pub mod crc;
mod error;
pub mod frame;
mod master;
mod response;
pub mod serial;
mod transport;

pub use error::{exception_message, ExceptionResponse, FrameError, ProtocolError, TransportError};
pub use frame::{build_command, wire_address, FrameBuilder, FunctionCode, EXCEPTION_BIT};
pub use master::ModbusMaster;
pub use response::{parse_response, Response};
pub use serial::{
    list_ports, open_port, preferred_port, sort_ports, ParitySetting, PortInfo, SerialLink,
    SerialSettings,
};
pub use transport::{expected_response_length, ConnectionState, LinkOpener, Transport};

/// Default baud rate for the meter link
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Most registers a single read request may ask for
pub const MAX_READ_REGISTERS: u16 = 125;

/// Most registers a single write-multiple request may carry
pub const MAX_WRITE_REGISTERS: u16 = 123;
