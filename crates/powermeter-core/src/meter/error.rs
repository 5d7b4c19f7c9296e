//! Meter-level errors

use thiserror::Error;

use crate::protocol::ProtocolError;

/// The register block is too short for the layout being decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{layout} reading needs {required} registers, got {received}")]
pub struct DecodeError {
    /// Layout being decoded ("basic" or "detailed")
    pub layout: &'static str,
    /// Registers the layout needs
    pub required: usize,
    /// Registers actually available
    pub received: usize,
}

/// Errors from reading and decoding the meter
#[derive(Error, Debug)]
pub enum MeterError {
    /// Modbus exchange failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Register block could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Neither connection-check register answered
    #[error("Meter is not responding on data scalar or tick counter registers")]
    NoResponse,

    /// Worker still holds the reader
    #[error("Poller lost its reader to a worker that did not shut down in time")]
    ReaderUnavailable,
}
