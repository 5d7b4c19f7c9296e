//! Meter configuration
//!
//! Stored as JSON. Every field has a default, so a partial file (or none at
//! all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::meter::{MeterReader, MultiplierSet, PlausibilityLimits, ReadingMode, DEFAULT_SCALAR};
use crate::poller::PollerConfig;
use crate::protocol::{ModbusMaster, SerialSettings};

/// Errors loading, saving or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Config file I/O error: {0}")]
    Io(#[from] io::Error),

    /// File is not valid JSON
    #[error("Config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where decoded readings are stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Append every reading to `path`
    pub enabled: bool,
    /// JSON-lines file readings are appended to
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("readings.jsonl"),
        }
    }
}

/// Complete poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Serial line parameters
    pub serial: SerialSettings,
    /// Modbus device (slave) address, 1-247
    pub device_address: u8,
    /// Seconds between poll cycles
    pub poll_interval_secs: u64,
    /// Read the 64-register detailed block instead of the basic one
    pub detailed: bool,
    /// Use `scaling_factors` instead of the scalar table
    pub override_scaling: bool,
    /// Multipliers used when `override_scaling` is set
    pub scaling_factors: MultiplierSet,
    /// Scalar assumed when the meter's scalar register can't be read
    pub default_scalar: u16,
    /// How long stopping waits for an in-flight poll cycle
    pub shutdown_timeout_secs: u64,
    /// Correction thresholds
    pub plausibility: PlausibilityLimits,
    /// Reading storage
    pub storage: StorageConfig,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            device_address: 1,
            poll_interval_secs: 5,
            detailed: true,
            override_scaling: false,
            scaling_factors: MultiplierSet::default(),
            default_scalar: DEFAULT_SCALAR,
            shutdown_timeout_secs: 10,
            plausibility: PlausibilityLimits::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl MeterConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: MeterConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Write configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject settings the poller can't run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=247).contains(&self.device_address) {
            return Err(ConfigError::Invalid(format!(
                "device address {} outside 1-247",
                self.device_address
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll interval must be at least 1 second".to_string(),
            ));
        }
        let limits = &self.plausibility;
        if limits.power_divisor <= 0.0 || limits.energy_divisor <= 0.0 {
            return Err(ConfigError::Invalid(
                "plausibility divisors must be positive".to_string(),
            ));
        }
        if limits.frequency_min >= limits.frequency_max {
            return Err(ConfigError::Invalid(format!(
                "frequency band {}-{} is empty",
                limits.frequency_min, limits.frequency_max
            )));
        }
        self.serial
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Register block read each cycle
    pub fn mode(&self) -> ReadingMode {
        if self.detailed {
            ReadingMode::Detailed
        } else {
            ReadingMode::Basic
        }
    }

    /// Manual multiplier set, when scaling override is enabled
    pub fn scaling_override(&self) -> Option<MultiplierSet> {
        self.override_scaling.then_some(self.scaling_factors)
    }

    /// Interval between poll cycles
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Longest wait for the worker when stopping
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reader for `master` with this configuration's scaling and limits
    pub fn reader(&self, master: Arc<ModbusMaster>) -> MeterReader {
        MeterReader::new(master)
            .with_scaling_override(self.scaling_override())
            .with_default_scalar(self.default_scalar)
            .with_plausibility(self.plausibility.clone())
    }

    /// Scheduler settings derived from this configuration
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            mode: self.mode(),
            poll_interval: self.poll_interval(),
            shutdown_timeout: self.shutdown_timeout(),
        }
    }
}
