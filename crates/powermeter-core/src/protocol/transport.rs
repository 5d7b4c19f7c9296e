//! Serial transport
//!
//! Owns exactly one serial link. A command is written after the receive
//! buffer is cleared, then exactly as many bytes as the command implies are
//! read back, or whatever arrived before the timeout.
//!
//! The transport does no locking of its own. [`super::ModbusMaster`] wraps it
//! in a mutex so that only one frame is ever in flight.

use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    serial::{open_port, SerialLink, SerialSettings},
    TransportError, EXCEPTION_BIT,
};

/// Fallback read size for commands whose reply length can't be derived
pub const UNKNOWN_RESPONSE_LEN: usize = 256;

/// Length of an exception reply: address, function, code, CRC
const EXCEPTION_RESPONSE_LEN: usize = 5;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Port open and usable
    Connected,
    /// Last connection attempt failed
    Error,
}

/// Opens a fresh link for the transport's settings
pub type LinkOpener =
    Box<dyn FnMut(&SerialSettings) -> Result<Box<dyn SerialLink>, TransportError> + Send>;

/// Number of bytes the reply to `command` should contain.
///
/// * function 3/4: `5 + 2 * count`
/// * function 6/16: 8
/// * anything else, or a command too short to tell: [`UNKNOWN_RESPONSE_LEN`]
pub fn expected_response_length(command: &[u8]) -> usize {
    if command.len() < 2 {
        return UNKNOWN_RESPONSE_LEN;
    }
    match command[1] {
        3 | 4 if command.len() >= 6 => {
            let count = u16::from_be_bytes([command[4], command[5]]) as usize;
            5 + count * 2
        }
        6 | 16 => 8,
        _ => UNKNOWN_RESPONSE_LEN,
    }
}

/// A serial connection to one meter
pub struct Transport {
    settings: SerialSettings,
    link: Option<Box<dyn SerialLink>>,
    opener: LinkOpener,
    state: ConnectionState,
    tx_bytes: u64,
    rx_bytes: u64,
    tx_frames: u64,
    rx_frames: u64,
}

impl Transport {
    /// Transport over a real serial port (not yet connected)
    pub fn new(settings: SerialSettings) -> Self {
        Self::with_opener(
            settings,
            Box::new(|s: &SerialSettings| {
                open_port(s).map(|port| Box::new(port) as Box<dyn SerialLink>)
            }),
        )
    }

    /// Transport whose links come from `opener` (not yet connected)
    pub fn with_opener(settings: SerialSettings, opener: LinkOpener) -> Self {
        Self {
            settings,
            link: None,
            opener,
            state: ConnectionState::Disconnected,
            tx_bytes: 0,
            rx_bytes: 0,
            tx_frames: 0,
            rx_frames: 0,
        }
    }

    /// Transport already attached to `link`; it cannot reconnect once closed
    pub fn with_link(settings: SerialSettings, link: Box<dyn SerialLink>) -> Self {
        let mut transport = Self::with_opener(
            settings,
            Box::new(
                |s: &SerialSettings| -> Result<Box<dyn SerialLink>, TransportError> {
                    Err(TransportError::ConnectionFailed {
                        port: s.port.clone(),
                        reason: "link was closed".to_string(),
                    })
                },
            ),
        );
        transport.link = Some(link);
        transport.state = ConnectionState::Connected;
        transport
    }

    /// Serial settings in use
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a link is open
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Cumulative (tx bytes, rx bytes, tx frames, rx frames)
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (self.tx_bytes, self.rx_bytes, self.tx_frames, self.rx_frames)
    }

    /// Open the link. Does nothing if it is already open.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }

        info!(
            "Connecting to device on {} at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        match (self.opener)(&self.settings) {
            Ok(link) => {
                self.link = Some(link);
                self.state = ConnectionState::Connected;
                info!("Successfully connected to {}", self.settings.port);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// Close the link
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("Serial connection to {} closed", self.settings.port);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Send a complete frame and collect the reply.
    ///
    /// Connects first if needed. Returns every byte received before the
    /// timeout, which may be fewer than expected (an exception reply, a
    /// truncated frame); an empty read is a [`TransportError::Timeout`].
    ///
    /// A write or I/O failure drops the link, so the next command reopens the
    /// port.
    pub fn send_command(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.connect()?;

        match self.exchange(frame) {
            Err(
                e @ (TransportError::WriteFailed(_)
                | TransportError::SerialError(_)
                | TransportError::IoError(_)),
            ) => {
                warn!("Dropping link to {}: {}", self.settings.port, e);
                self.link = None;
                self.state = ConnectionState::Error;
                Err(e)
            }
            other => other,
        }
    }

    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let timeout = self.settings.timeout();
        let mut expected = expected_response_length(frame);
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        link.clear_input()
            .map_err(|e| TransportError::SerialError(e.to_string()))?;

        debug!("send_command: sending {} bytes: {:02x?}", frame.len(), frame);
        link.write_frame(frame)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.tx_bytes += frame.len() as u64;
        self.tx_frames += 1;

        let mut buf = vec![0u8; expected];
        let received = read_until(link.as_mut(), &mut buf, &mut expected, timeout)?;
        buf.truncate(received);

        if received == 0 {
            return Err(TransportError::Timeout {
                expected,
                timeout_ms: self.settings.timeout_ms,
            });
        }
        if received < expected {
            warn!(
                "send_command: short read, {} of {} bytes before timeout",
                received, expected
            );
        }

        debug!("Received response: {:02x?}", buf);
        self.rx_bytes += received as u64;
        self.rx_frames += 1;
        Ok(buf)
    }
}

/// Read into `buf` until `expected` bytes have arrived or `timeout` elapses.
///
/// `expected` shrinks to the exception reply length as soon as the function
/// byte shows the exception bit.
fn read_until(
    link: &mut dyn SerialLink,
    buf: &mut [u8],
    expected: &mut usize,
    timeout: Duration,
) -> Result<usize, TransportError> {
    let start = Instant::now();
    let mut offset = 0;

    while offset < *expected {
        if start.elapsed() > timeout {
            debug!(
                "read_until: timed out after reading {} of {} bytes",
                offset, expected
            );
            break;
        }

        match link.read_available(&mut buf[offset..*expected]) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => {
                offset += n;
                if offset >= 2 && buf[1] & EXCEPTION_BIT != 0 {
                    *expected = (*expected).min(EXCEPTION_RESPONSE_LEN);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => return Err(TransportError::IoError(e)),
        }
    }

    Ok(offset.min(*expected))
}
