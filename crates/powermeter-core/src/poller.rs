//! Polling scheduler
//!
//! One worker thread owns the [`MeterReader`]: it reads the data scalar once,
//! then loops read/decode/filter/publish at a fixed interval. Every failure
//! inside a cycle is logged and the next cycle runs as scheduled.
//!
//! Readings are published through a [`SnapshotStore`], an atomically swapped
//! immutable value, so readers never see a half-built reading.

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::meter::{MeterError, MeterReader, Reading, ReadingMode};
use crate::protocol::{self, ModbusMaster, ProtocolError, Response, MAX_READ_REGISTERS};
use crate::storage::ReadingSink;

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollerState {
    /// Created, never started
    Idle,
    /// Opening the serial link
    Connecting,
    /// Worker running
    Polling,
    /// Worker finished after a stop request
    Stopped,
    /// Connection failed on start; no retry is attempted
    Failed,
}

/// Scheduler timing and block selection
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Block read each cycle
    pub mode: ReadingMode,
    /// Interval between cycles
    pub poll_interval: Duration,
    /// Longest `stop` waits for the worker to finish its cycle
    pub shutdown_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            mode: ReadingMode::Detailed,
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Latest published reading
#[derive(Default)]
pub struct SnapshotStore {
    latest: ArcSwapOption<Reading>,
}

impl SnapshotStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published reading
    pub fn publish(&self, reading: Reading) {
        self.latest.store(Some(Arc::new(reading)));
    }

    /// Latest reading, if any has been published
    pub fn latest(&self) -> Option<Arc<Reading>> {
        self.latest.load_full()
    }
}

/// On-demand access for callers outside the polling loop.
///
/// Requests go through the same [`ModbusMaster`] as the poller and are
/// serialized with its cycles.
#[derive(Clone)]
pub struct MeterHandle {
    master: Arc<ModbusMaster>,
    snapshots: Arc<SnapshotStore>,
}

impl MeterHandle {
    /// Handle over `master` and `snapshots`
    pub fn new(master: Arc<ModbusMaster>, snapshots: Arc<SnapshotStore>) -> Self {
        Self { master, snapshots }
    }

    /// Latest published reading; never blocks
    pub fn latest_snapshot(&self) -> Option<Arc<Reading>> {
        self.snapshots.latest()
    }

    /// Read one holding register at a logical address
    pub fn read_register(&self, address: u16) -> Result<u16, ProtocolError> {
        self.master.read_register(address)
    }

    /// Read `count` holding registers, with `count` clamped to 1-125
    pub fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        let count = count.clamp(1, MAX_READ_REGISTERS);
        self.master.read_holding_registers(start, count)
    }

    /// Send a caller-built frame and return the raw reply
    pub fn send_raw_command(&self, command: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        info!("Sending raw Modbus command: {:02x?}", command);
        self.master.send_raw(command)
    }

    /// Parse a raw reply against the command that produced it
    pub fn parse_response(&self, command: &[u8], response: &[u8]) -> Result<Response, ProtocolError> {
        protocol::parse_response(command, response)
    }
}

/// What the worker hands back when it exits
struct WorkerParts {
    reader: MeterReader,
    sink: Option<Box<dyn ReadingSink>>,
}

/// A running worker
struct Worker {
    stop: Arc<AtomicBool>,
    wake: mpsc::Sender<()>,
    done: mpsc::Receiver<()>,
    handle: JoinHandle<WorkerParts>,
}

/// Periodic reader of one meter
pub struct Poller {
    parts: Option<WorkerParts>,
    config: PollerConfig,
    master: Arc<ModbusMaster>,
    snapshots: Arc<SnapshotStore>,
    state: Arc<Mutex<PollerState>>,
    worker: Option<Worker>,
}

impl Poller {
    /// Poller for `reader`; nothing runs until `start`
    pub fn new(reader: MeterReader, config: PollerConfig) -> Self {
        let master = reader.master().clone();
        Self {
            parts: Some(WorkerParts { reader, sink: None }),
            config,
            master,
            snapshots: Arc::new(SnapshotStore::new()),
            state: Arc::new(Mutex::new(PollerState::Idle)),
            worker: None,
        }
    }

    /// Hand every decoded reading to `sink` as well as publishing it
    pub fn with_sink(mut self, sink: Box<dyn ReadingSink>) -> Self {
        if let Some(parts) = self.parts.as_mut() {
            parts.sink = Some(sink);
        }
        self
    }

    /// On-demand handle sharing this poller's transport and snapshots
    pub fn handle(&self) -> MeterHandle {
        MeterHandle::new(self.master.clone(), self.snapshots.clone())
    }

    /// Snapshot store the worker publishes to
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Current state
    pub fn state(&self) -> PollerState {
        read_state(&self.state)
    }

    /// Connect and start the worker.
    ///
    /// A connection failure leaves the poller in [`PollerState::Failed`] and
    /// is returned here; nothing retries it.
    pub fn start(&mut self) -> Result<(), MeterError> {
        if self.worker.is_some() && self.state() == PollerState::Polling {
            warn!("Poller already running");
            return Ok(());
        }
        let parts = self.parts.take().ok_or(MeterError::ReaderUnavailable)?;

        set_state(&self.state, PollerState::Connecting);
        if let Err(e) = self.master.connect() {
            set_state(&self.state, PollerState::Failed);
            self.parts = Some(parts);
            return Err(e.into());
        }

        set_state(&self.state, PollerState::Polling);
        let stop = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let worker_stop = stop.clone();
        let snapshots = self.snapshots.clone();
        let state = self.state.clone();
        let config = self.config.clone();

        let handle = thread::spawn(move || {
            let mut parts = parts;
            if parts.reader.data_scalar().is_none() {
                if let Err(e) = parts.reader.read_data_scalar() {
                    warn!("Initial data scalar read failed: {}", e);
                }
            }

            loop {
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                poll_cycle(&mut parts, config.mode, &snapshots);

                match wake_rx.recv_timeout(config.poll_interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            set_state(&state, PollerState::Stopped);
            let _ = done_tx.send(());
            parts
        });

        self.worker = Some(Worker {
            stop,
            wake: wake_tx,
            done: done_rx,
            handle,
        });
        info!(
            "Poller started ({:?} mode, every {:?})",
            self.config.mode, self.config.poll_interval
        );
        Ok(())
    }

    /// Stop the worker, waiting up to the shutdown timeout for its cycle.
    ///
    /// If the worker doesn't finish in time it is left to exit on its own
    /// and the poller can't be restarted.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        worker.stop.store(true, Ordering::SeqCst);
        let _ = worker.wake.send(());

        match worker.done.recv_timeout(self.config.shutdown_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Poller did not stop within {:?}, detaching worker",
                    self.config.shutdown_timeout
                );
                set_state(&self.state, PollerState::Stopped);
                return;
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        }

        match worker.handle.join() {
            Ok(parts) => self.parts = Some(parts),
            Err(_) => error!("Poller worker panicked"),
        }
        set_state(&self.state, PollerState::Stopped);
        self.master.disconnect();
        info!("Poller stopped");
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One read/decode/filter/publish cycle; failures are logged, never raised
fn poll_cycle(parts: &mut WorkerParts, mode: ReadingMode, snapshots: &SnapshotStore) {
    match parts.reader.read(mode) {
        Ok(reading) => {
            info!("Updated readings: Power={:.2}kW", reading.power_kw());
            if let Some(sink) = parts.sink.as_mut() {
                if let Err(e) = sink.store_reading(&reading) {
                    warn!("Failed to store reading: {}", e);
                }
            }
            snapshots.publish(reading);
        }
        Err(e) => error!("Error in meter reading loop: {}", e),
    }
}

fn read_state(state: &Mutex<PollerState>) -> PollerState {
    state.lock().map(|s| *s).unwrap_or(PollerState::Failed)
}

fn set_state(state: &Mutex<PollerState>, next: PollerState) {
    if let Ok(mut s) = state.lock() {
        *s = next;
    }
}
