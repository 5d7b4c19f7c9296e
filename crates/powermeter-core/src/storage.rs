//! Reading storage
//!
//! The poller hands every successfully decoded reading to a [`ReadingSink`].
//! Sink failures are logged by the caller and never stop polling.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::meter::Reading;

/// Errors from storing a reading
#[derive(Error, Debug)]
pub enum SinkError {
    /// Write failed
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// Reading could not be serialized
    #[error("Failed to serialize reading: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for decoded readings
pub trait ReadingSink: Send {
    /// Persist one reading
    fn store_reading(&mut self, reading: &Reading) -> Result<(), SinkError>;
}

/// Appends one JSON object per reading to a file
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// File readings are appended to
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadingSink for JsonLinesSink {
    fn store_reading(&mut self, reading: &Reading) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, reading)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        debug!("Stored reading in {}", self.path.display());
        Ok(())
    }
}

/// Read back every reading stored in a JSON-lines file
pub fn load_readings<P: AsRef<Path>>(path: P) -> Result<Vec<Reading>, SinkError> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(SinkError::from))
        .collect()
}
