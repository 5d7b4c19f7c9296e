//! Meter reader
//!
//! Resolves the data scalar, reads a register block and turns it into a
//! filtered [`Reading`].

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    decoder::{decode_basic, decode_detailed},
    error::MeterError,
    plausibility::{PlausibilityFilter, PlausibilityLimits},
    reading::{Reading, ReadingMode},
    registers::{BASIC_BLOCK_LEN, BLOCK_START, DATA_SCALAR, DATA_TICK_COUNTER, DETAILED_BLOCK_LEN},
    scaling::{multipliers_for, MultiplierSet, DEFAULT_SCALAR},
};
use crate::protocol::ModbusMaster;

/// Reads and decodes one meter
pub struct MeterReader {
    master: Arc<ModbusMaster>,
    scaling_override: Option<MultiplierSet>,
    default_scalar: u16,
    filter: PlausibilityFilter,
    data_scalar: Option<u16>,
}

impl MeterReader {
    /// Reader with table scaling, the default fallback scalar and default limits
    pub fn new(master: Arc<ModbusMaster>) -> Self {
        Self {
            master,
            scaling_override: None,
            default_scalar: DEFAULT_SCALAR,
            filter: PlausibilityFilter::default(),
            data_scalar: None,
        }
    }

    /// Use `set` for every reading instead of the scalar table
    pub fn with_scaling_override(mut self, set: Option<MultiplierSet>) -> Self {
        self.scaling_override = set;
        self
    }

    /// Scalar assumed when the scalar register can't be read
    pub fn with_default_scalar(mut self, scalar: u16) -> Self {
        self.default_scalar = scalar;
        self
    }

    /// Use `limits` for the plausibility stage
    pub fn with_plausibility(mut self, limits: PlausibilityLimits) -> Self {
        self.filter = PlausibilityFilter::new(limits);
        self
    }

    /// Shared master, for on-demand requests
    pub fn master(&self) -> &Arc<ModbusMaster> {
        &self.master
    }

    /// Cached data scalar, if one has been read
    pub fn data_scalar(&self) -> Option<u16> {
        self.data_scalar
    }

    /// Read the data scalar register and cache it
    pub fn read_data_scalar(&mut self) -> Result<u16, MeterError> {
        let scalar = self.master.read_register(DATA_SCALAR)?;
        info!("Read data scalar value: {}", scalar);
        self.data_scalar = Some(scalar);
        Ok(scalar)
    }

    /// Cached scalar, else a fresh read, else the configured default.
    ///
    /// The default is not cached, so the real scalar is picked up as soon as
    /// the meter answers.
    fn resolve_scalar(&mut self) -> u16 {
        if let Some(scalar) = self.data_scalar {
            return scalar;
        }
        match self.read_data_scalar() {
            Ok(scalar) => scalar,
            Err(e) => {
                warn!(
                    "Could not read data scalar ({}), using default scalar value: {}",
                    e, self.default_scalar
                );
                self.default_scalar
            }
        }
    }

    /// Multiplier set for `scalar` under this reader's scaling policy
    pub fn multipliers(&self, scalar: u16) -> MultiplierSet {
        multipliers_for(scalar, self.scaling_override)
    }

    /// Read, decode and filter one reading in `mode`
    pub fn read(&mut self, mode: ReadingMode) -> Result<Reading, MeterError> {
        let scalar = self.resolve_scalar();
        let multipliers = self.multipliers(scalar);

        let (count, layout) = match mode {
            ReadingMode::Basic => (BASIC_BLOCK_LEN, "basic"),
            ReadingMode::Detailed => (DETAILED_BLOCK_LEN, "detailed"),
        };
        let registers = self
            .master
            .read_holding_registers(BLOCK_START, count)
            .map_err(|e| {
                warn!("Failed to read {} registers: {}", layout, e);
                e
            })?;
        debug!("{} block: {:?}", layout, registers);

        let now = Utc::now();
        let reading: Reading = match mode {
            ReadingMode::Basic => decode_basic(&registers, scalar, multipliers, now)?.into(),
            ReadingMode::Detailed => decode_detailed(&registers, scalar, multipliers, now)?.into(),
        };
        Ok(self.filter.apply(reading))
    }

    /// Read the flat basic reading
    pub fn read_basic(&mut self) -> Result<Reading, MeterError> {
        self.read(ReadingMode::Basic)
    }

    /// Read the detailed reading with per-phase values
    pub fn read_detailed(&mut self) -> Result<Reading, MeterError> {
        self.read(ReadingMode::Detailed)
    }

    /// Check that the meter answers.
    ///
    /// Reads the data scalar (caching it on success), falling back to the
    /// data tick counter.
    pub fn test_connection(&mut self) -> Result<(), MeterError> {
        match self.read_data_scalar() {
            Ok(scalar) => {
                info!("Connection test successful. Data scalar: {}", scalar);
                return Ok(());
            }
            Err(e) => debug!("Data scalar check failed: {}", e),
        }

        match self.master.read_register(DATA_TICK_COUNTER) {
            Ok(tick) => {
                info!(
                    "Connection test successful using fallback register. Value: {}",
                    tick
                );
                Ok(())
            }
            Err(e) => {
                warn!("Connection test failed - couldn't read registers: {}", e);
                Err(MeterError::NoResponse)
            }
        }
    }
}
