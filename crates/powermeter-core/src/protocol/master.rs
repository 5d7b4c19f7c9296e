//! Modbus RTU master
//!
//! Every exchange takes the transport lock for the full write/read cycle, so
//! the poller and on-demand callers never interleave frames on the line.

use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::{
    frame::build_command, parse_response, ConnectionState, FrameError, FunctionCode,
    ProtocolError, Response, Transport, TransportError,
};

/// Master side of one device session
pub struct ModbusMaster {
    transport: Mutex<Transport>,
    device_address: u8,
}

impl ModbusMaster {
    /// Wrap `transport`, addressing requests to `device_address`
    pub fn new(transport: Transport, device_address: u8) -> Self {
        Self {
            transport: Mutex::new(transport),
            device_address,
        }
    }

    /// Device (slave) address requests are sent to
    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    fn lock(&self) -> Result<MutexGuard<'_, Transport>, TransportError> {
        self.transport
            .lock()
            .map_err(|_| TransportError::LockPoisoned)
    }

    /// Open the serial link
    pub fn connect(&self) -> Result<(), ProtocolError> {
        let mut transport = self.lock()?;
        transport.connect().map_err(|e| {
            error!("Failed to connect to {}: {}", transport.settings().port, e);
            ProtocolError::from(e)
        })
    }

    /// Close the serial link
    pub fn disconnect(&self) {
        if let Ok(mut transport) = self.lock() {
            transport.disconnect();
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.lock()
            .map(|t| t.state())
            .unwrap_or(ConnectionState::Error)
    }

    /// Cumulative (tx bytes, rx bytes, tx frames, rx frames)
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        self.lock().map(|t| t.counters()).unwrap_or_default()
    }

    /// Send a pre-built frame and return the raw reply
    pub fn send_raw(&self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut transport = self.lock()?;
        transport.send_command(frame).map_err(|e| {
            warn!("Error sending command {:02x?}: {}", frame, e);
            ProtocolError::from(e)
        })
    }

    /// Build `frame`, exchange it, and parse the reply
    fn request(&self, frame: &[u8]) -> Result<Response, ProtocolError> {
        let raw = self.send_raw(frame)?;
        parse_response(frame, &raw)
    }

    fn read(
        &self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        let frame = build_command(self.device_address, function, address, count, None)?;
        let response = self.request(&frame).map_err(|e| {
            warn!("Failed to read {} registers from {}: {}", count, address, e);
            e
        })?;

        match response {
            Response::Registers { values, .. } => Ok(values),
            other => Err(FrameError::UnexpectedFunction {
                expected: function.code(),
                actual: response_function(&other),
            }
            .into()),
        }
    }

    /// Read `count` holding registers (function 3) starting at logical `address`
    pub fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        self.read(FunctionCode::ReadHoldingRegisters, address, count)
    }

    /// Read `count` input registers (function 4) starting at logical `address`
    pub fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        self.read(FunctionCode::ReadInputRegisters, address, count)
    }

    /// Read a single holding register
    pub fn read_register(&self, address: u16) -> Result<u16, ProtocolError> {
        let values = self.read_holding_registers(address, 1)?;
        values.first().copied().ok_or_else(|| {
            FrameError::RegisterCountMismatch {
                requested: 1,
                received: 0,
            }
            .into()
        })
    }

    /// Write one register (function 6); the device must echo address and value
    pub fn write_register(&self, address: u16, value: u16) -> Result<(), ProtocolError> {
        let frame = build_command(
            self.device_address,
            FunctionCode::WriteSingleRegister,
            address,
            1,
            Some(&[value]),
        )?;
        match self.request(&frame)? {
            Response::WriteSingle {
                address: echoed,
                value: echoed_value,
                ..
            } if [echoed.to_be_bytes(), echoed_value.to_be_bytes()].concat() == frame[2..6] => {
                info!("Successfully wrote value {} to register {}", value, address);
                Ok(())
            }
            _ => {
                warn!("Response mismatch when writing to register {}", address);
                Err(FrameError::EchoMismatch { address }.into())
            }
        }
    }
}

fn response_function(response: &Response) -> u8 {
    match response {
        Response::Registers { function, .. } | Response::Other { function, .. } => *function,
        Response::WriteSingle { .. } => FunctionCode::WriteSingleRegister.code(),
        Response::WriteMultiple { .. } => FunctionCode::WriteMultipleRegisters.code(),
    }
}
