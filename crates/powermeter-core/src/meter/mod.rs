//! Power meter decoding
//!
//! Register map, scalar-dependent scaling, block decoding and the
//! plausibility stage, tied together by [`MeterReader`].

pub mod decoder;
mod error;
pub mod plausibility;
pub mod reader;
pub mod reading;
pub mod registers;
pub mod scaling;

pub use decoder::{combine_u32, decode_basic, decode_detailed};
pub use error::{DecodeError, MeterError};
pub use plausibility::{frequency_from_raw, PlausibilityFilter, PlausibilityLimits};
pub use reader::MeterReader;
pub use reading::{
    BasicReading, Correction, CorrectionKind, DetailedReading, PhaseValues, Reading, ReadingMode,
};
pub use registers::{parse_register, register_address, register_group, register_name, RegisterGroup};
pub use scaling::{multipliers_for, MultiplierSet, ScalarSelection, DEFAULT_SCALAR};
