//! # PowerMeter Core Library
//!
//! Core functionality for polling a three-phase power meter over Modbus RTU.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Modbus RTU framing, CRC-16 and response parsing
//! - A serial transport that keeps one frame in flight at a time
//! - Register decoding with the meter's scalar-dependent multiplier table
//! - A plausibility stage for values the meter family is known to garble
//! - A polling scheduler publishing immutable snapshots
//! - A simulated meter for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use powermeter_core::prelude::*;
//!
//! let config = MeterConfig::load("powermeter.json")?;
//! let master = Arc::new(ModbusMaster::new(
//!     Transport::new(config.serial.clone()),
//!     config.device_address,
//! ));
//!
//! let mut poller = Poller::new(config.reader(master), config.poller_config());
//! poller.start()?;
//! if let Some(reading) = poller.handle().latest_snapshot() {
//!     println!("Power: {} kW", reading.power_kw());
//! }
//! ```

pub mod config;
pub mod meter;
pub mod poller;
pub mod protocol;
pub mod simulator;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, MeterConfig, StorageConfig};
    pub use crate::meter::{
        MeterError, MeterReader, MultiplierSet, PlausibilityFilter, PlausibilityLimits, Reading,
        ReadingMode,
    };
    pub use crate::poller::{MeterHandle, Poller, PollerConfig, PollerState, SnapshotStore};
    pub use crate::protocol::{
        list_ports, ModbusMaster, ProtocolError, SerialSettings, Transport, TransportError,
    };
    pub use crate::simulator::SimulatedMeter;
    pub use crate::storage::{JsonLinesSink, ReadingSink, SinkError};
}
