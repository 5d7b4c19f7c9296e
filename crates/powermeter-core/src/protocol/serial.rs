//! Serial port handling
//!
//! Provides low-level serial port access for the meter link and the
//! [`SerialLink`] abstraction the transport talks to.

use serde::{Deserialize, Serialize};
use serialport::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType,
    StopBits,
};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ProtocolError, TransportError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Per-read timeout of the underlying port; the transport loops on it until
/// its own deadline.
const READ_POLL_MS: u64 = 20;

/// Byte-level access to a half-duplex serial line
pub trait SerialLink: Send {
    /// Discard anything waiting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;

    /// Write a whole frame
    fn write_frame(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available into `buf`.
    ///
    /// Returns `Ok(0)` or a `TimedOut`/`WouldBlock` error when nothing arrived
    /// within the link's own poll interval.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)?;
        self.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Parity setting as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParitySetting {
    /// No parity
    #[default]
    #[serde(rename = "N")]
    None,
    /// Even parity
    #[serde(rename = "E")]
    Even,
    /// Odd parity
    #[serde(rename = "O")]
    Odd,
    /// Mark parity
    #[serde(rename = "M")]
    Mark,
    /// Space parity
    #[serde(rename = "S")]
    Space,
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM4")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    /// Data bits, 5 to 8
    pub byte_size: u8,
    /// Parity
    pub parity: ParitySetting,
    /// Stop bits, 1 or 2
    pub stop_bits: u8,
    /// Software (XON/XOFF) flow control
    pub xonxoff: bool,
    /// Hardware (RTS/CTS) flow control
    pub rtscts: bool,
    /// DSR/DTR handshaking
    pub dsrdtr: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            byte_size: 8,
            parity: ParitySetting::None,
            stop_bits: 1,
            xonxoff: false,
            rtscts: false,
            dsrdtr: false,
        }
    }
}

impl SerialSettings {
    /// Settings for `port` with every other parameter at its default
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn data_bits(&self) -> Result<DataBits, ProtocolError> {
        match self.byte_size {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            n => Err(ProtocolError::Configuration(format!(
                "unsupported byte size {}",
                n
            ))),
        }
    }

    fn serial_parity(&self) -> Result<Parity, ProtocolError> {
        match self.parity {
            ParitySetting::None => Ok(Parity::None),
            ParitySetting::Even => Ok(Parity::Even),
            ParitySetting::Odd => Ok(Parity::Odd),
            other => Err(ProtocolError::Configuration(format!(
                "parity {:?} is not supported by this platform's serial driver",
                other
            ))),
        }
    }

    fn serial_stop_bits(&self) -> Result<StopBits, ProtocolError> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            n => Err(ProtocolError::Configuration(format!(
                "unsupported stop bits {}",
                n
            ))),
        }
    }

    fn flow_control(&self) -> FlowControl {
        if self.rtscts {
            FlowControl::Hardware
        } else if self.xonxoff {
            FlowControl::Software
        } else {
            FlowControl::None
        }
    }

    /// Check that every parameter maps onto something the driver can open
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.port.is_empty() {
            return Err(ProtocolError::Configuration("empty port name".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::Configuration("baud rate is 0".to_string()));
        }
        self.data_bits()?;
        self.serial_parity()?;
        self.serial_stop_bits()?;
        Ok(())
    }
}

/// USB vendor IDs of the serial bridge chips RS-485 adapters are built on
const RS485_BRIDGES: &[(u16, &str)] = &[
    (0x0403, "FTDI"),
    (0x10C4, "CP210x"),
    (0x1A86, "CH340"),
    (0x067B, "PL2303"),
];

/// Device name prefixes looked for under /dev when enumeration misses them
#[cfg(target_os = "linux")]
const DEV_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "ttyAMA"];

/// A serial port the meter could be attached to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortInfo {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM4`
    pub name: String,
    /// USB vendor ID, for USB adapters
    pub vid: Option<u16>,
    /// USB product ID, for USB adapters
    pub pid: Option<u16>,
    /// Manufacturer string reported by the adapter
    pub manufacturer: Option<String>,
    /// Product string reported by the adapter
    pub product: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Bridge chip, when the port is a known USB-serial bridge
    pub fn bridge(&self) -> Option<&'static str> {
        let vid = self.vid?;
        RS485_BRIDGES
            .iter()
            .find(|(v, _)| *v == vid)
            .map(|(_, chip)| *chip)
    }

    /// One-line description for port listings
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(chip) = self.bridge() {
            parts.push(format!("[{}]", chip));
        }
        parts.extend(self.manufacturer.iter().cloned());
        parts.extend(self.product.iter().cloned());
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            parts.push(format!("{:04x}:{:04x}", vid, pid));
        }
        if parts.is_empty() {
            self.name.clone()
        } else {
            format!("{}  {}", self.name, parts.join(" "))
        }
    }

    fn rank(&self) -> (u8, u32, String) {
        let base = self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name);
        let stem = base.trim_end_matches(|c: char| c.is_ascii_digit());
        let number = base[stem.len()..].parse::<u32>().unwrap_or(u32::MAX);
        let class = if self.bridge().is_some() {
            0
        } else if self.vid.is_some() || matches!(stem, "ttyUSB" | "ttyACM" | "COM") {
            1
        } else {
            2
        };
        (class, number, base.to_string())
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::named(info.port_name),
        }
    }
}

/// Order ports by how likely they are to carry the meter: known RS-485
/// bridges, then other USB or COM ports, then the rest. Numbered ports sort
/// numerically within each class.
pub fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by_key(PortInfo::rank);
}

/// Available serial ports, likeliest meter adapter first
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        found.entry(port.name.clone()).or_insert(port);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for name in entries.flatten().filter_map(|e| e.file_name().into_string().ok()) {
            if DEV_PREFIXES.iter().any(|p| name.starts_with(p)) {
                let path = format!("/dev/{}", name);
                found
                    .entry(path.clone())
                    .or_insert_with(|| PortInfo::named(path));
            }
        }
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    sort_ports(&mut ports);
    ports
}

/// Port `--port auto` resolves to: the first port of a sorted listing that
/// is a bridge or a USB/COM port
pub fn preferred_port(ports: &[PortInfo]) -> Option<&PortInfo> {
    ports.first().filter(|p| p.rank().0 < 2)
}

/// Open and configure a serial port
pub fn open_port(settings: &SerialSettings) -> Result<Box<dyn SerialPort>, TransportError> {
    let config_err = |e: ProtocolError| TransportError::ConnectionFailed {
        port: settings.port.clone(),
        reason: e.to_string(),
    };

    let mut port = serialport::new(&settings.port, settings.baud_rate)
        .data_bits(settings.data_bits().map_err(config_err)?)
        .parity(settings.serial_parity().map_err(config_err)?)
        .stop_bits(settings.serial_stop_bits().map_err(config_err)?)
        .flow_control(settings.flow_control())
        .timeout(Duration::from_millis(READ_POLL_MS))
        .open()
        .map_err(|e| TransportError::ConnectionFailed {
            port: settings.port.clone(),
            reason: e.to_string(),
        })?;

    configure_port(port.as_mut(), settings);
    clear_buffers(port.as_mut())?;
    Ok(port)
}

/// Drive the modem control lines the way the settings ask for
fn configure_port(port: &mut dyn SerialPort, settings: &SerialSettings) {
    if settings.dsrdtr {
        // No DSR/DTR flow control in the driver; keep DTR asserted instead
        if let Err(e) = port.write_data_terminal_ready(true) {
            warn!("configure_port: failed to set DTR high: {} (continuing)", e);
        } else {
            debug!("configure_port: DTR set high");
        }
    }
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.clear(ClearBuffer::All)
        .map_err(|e| TransportError::SerialError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            vid: Some(vid),
            pid: Some(pid),
            ..PortInfo::named(name)
        }
    }

    fn names(ports: &[PortInfo]) -> Vec<&str> {
        ports.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_list_ports() {
        // Enumeration must not panic, and comes back sorted
        let ports = list_ports();
        let mut sorted = ports.clone();
        sort_ports(&mut sorted);
        assert_eq!(ports, sorted);
    }

    #[test]
    fn test_bridges_sort_first() {
        let mut ports = vec![
            PortInfo::named("/dev/ttyS0"),
            PortInfo::named("/dev/ttyUSB10"),
            usb("/dev/ttyACM0", 0x2341, 0x0043),
            PortInfo::named("/dev/ttyUSB2"),
            usb("/dev/ttyUSB3", 0x1A86, 0x7523),
            usb("/dev/ttyUSB1", 0x0403, 0x6001),
        ];
        sort_ports(&mut ports);
        assert_eq!(
            names(&ports),
            vec![
                "/dev/ttyUSB1",
                "/dev/ttyUSB3",
                "/dev/ttyACM0",
                "/dev/ttyUSB2",
                "/dev/ttyUSB10",
                "/dev/ttyS0",
            ]
        );
        assert_eq!(ports[0].bridge(), Some("FTDI"));
        assert_eq!(ports[1].bridge(), Some("CH340"));
        assert_eq!(ports[2].bridge(), None);
    }

    #[test]
    fn test_com_ports_sort_numerically() {
        let mut ports = vec![
            PortInfo::named("COM10"),
            PortInfo::named("COM3"),
            usb("COM7", 0x10C4, 0xEA60),
        ];
        sort_ports(&mut ports);
        assert_eq!(names(&ports), vec!["COM7", "COM3", "COM10"]);
    }

    #[test]
    fn test_preferred_port() {
        let mut ports = vec![PortInfo::named("/dev/ttyS0"), PortInfo::named("/dev/ttyUSB0")];
        sort_ports(&mut ports);
        assert_eq!(preferred_port(&ports).map(|p| p.name.as_str()), Some("/dev/ttyUSB0"));

        let only_uart = vec![PortInfo::named("/dev/ttyS0")];
        assert_eq!(preferred_port(&only_uart), None);
        assert_eq!(preferred_port(&[]), None);
    }

    #[test]
    fn test_description() {
        let mut port = usb("/dev/ttyUSB0", 0x0403, 0x6001);
        port.product = Some("USB-RS485 Cable".to_string());
        assert_eq!(
            port.description(),
            "/dev/ttyUSB0  [FTDI] USB-RS485 Cable 0403:6001"
        );
        assert_eq!(PortInfo::named("COM3").description(), "COM3");
    }

    #[test]
    fn test_settings_validation() {
        assert!(SerialSettings::default().validate().is_ok());

        let mut s = SerialSettings::default();
        s.stop_bits = 3;
        assert!(s.validate().is_err());

        let mut s = SerialSettings::default();
        s.parity = ParitySetting::Mark;
        assert!(s.validate().is_err());

        let mut s = SerialSettings::default();
        s.byte_size = 9;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_parity_serde_letters() {
        let s: SerialSettings = serde_json::from_str(r#"{"parity": "E"}"#).unwrap();
        assert_eq!(s.parity, ParitySetting::Even);
        assert_eq!(s.baud_rate, DEFAULT_BAUD_RATE);
    }
}
