//! Byte transports and the policy that picks one for an address.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serialport::{ClearBuffer, SerialPort};

use crate::bluetooth::BluetoothConnector;
use crate::config::ConnectionConfig;
use crate::errors::{DriverError, Result, TransportError, TransportErrorKind};

/// Serial baud rate used by BITalino devices.
pub const BAUD_RATE: u32 = 115200;

/// Node created by `rfcomm bind`, preferred when present.
pub const DEFAULT_SERIAL_NODE: &str = "/dev/rfcomm0";

/// RFCOMM channel the device listens on.
pub const RFCOMM_CHANNEL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    Serial,
    Bluetooth,
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Bluetooth => f.write_str("bluetooth"),
            TransportKind::Simulated => f.write_str("simulated"),
        }
    }
}

/// Raw byte channel to a device.
///
/// `read` blocks for at most the transport's read timeout and returns `Ok(0)`
/// when nothing arrived in that window. A peer that hung up is an error
/// (`TransportErrorKind::Reset`), not an empty read.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransportError>;

    fn write(&mut self, bytes: &[u8]) -> std::result::Result<usize, TransportError>;

    /// Release the underlying handle. Dropping the transport has the same
    /// effect; this exists so the release can be logged and ordered.
    fn close(&mut self);

    fn kind(&self) -> TransportKind;
}

/// Opens transports for addresses. The hardware and simulated device
/// variants both sit behind this.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Box<dyn Transport>>;
}

/// Where a given address will be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The well-known local node (e.g. `/dev/rfcomm0`) exists; use it.
    SerialNode(PathBuf),
    /// Direct RFCOMM socket to a MAC address.
    Bluetooth(String),
    /// Anything else is taken as a serial port path.
    SerialPath(String),
}

/// Six colon-separated hex octet pairs, 17 characters.
pub fn is_mac_address(address: &str) -> bool {
    address.len() == 17
        && address.split(':').count() == 6
        && address
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Pick a route. `existing_node` must only be passed when the node exists.
pub fn select_route(address: &str, existing_node: Option<&Path>) -> Route {
    if let Some(node) = existing_node {
        return Route::SerialNode(node.to_path_buf());
    }
    if is_mac_address(address) {
        Route::Bluetooth(address.to_string())
    } else {
        Route::SerialPath(address.to_string())
    }
}

/// Serial port transport (USB dongle or a bound rfcomm node).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> std::result::Result<Self, TransportError> {
        debug!("opening serial port: path={}, baud={}", path, baud_rate);
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> std::result::Result<usize, TransportError> {
        let written = self.port.write(bytes)?;
        self.port.flush()?;
        Ok(written)
    }

    fn close(&mut self) {
        if let Err(e) = self.port.clear(ClearBuffer::All) {
            debug!("serial buffer clear on close failed: path={}, error={}", self.path, e);
        }
        debug!("serial port closed: path={}", self.path);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

/// Opens real hardware: serial node, RFCOMM socket or serial path.
#[derive(Debug, Clone)]
pub struct SystemConnector {
    pub serial_node: Option<PathBuf>,
    pub baud_rate: u32,
    pub rfcomm_channel: u8,
    pub io_timeout: Duration,
}

impl SystemConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            serial_node: config.serial_node.clone(),
            baud_rate: config.baud_rate,
            rfcomm_channel: config.rfcomm_channel,
            io_timeout: config.io_timeout,
        }
    }

    fn open_serial(&self, address: &str, path: &str) -> Result<Box<dyn Transport>> {
        SerialTransport::open(path, self.baud_rate, self.io_timeout)
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .map_err(|e| DriverError::connection(address, e))
    }
}

impl Default for SystemConnector {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default())
    }
}

impl Connector for SystemConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn Transport>> {
        if address.trim().is_empty() {
            return Err(DriverError::Configuration(
                "a MAC address or serial port is needed to connect".into(),
            ));
        }

        let node = self.serial_node.as_deref().filter(|p| p.exists());
        match select_route(address, node) {
            Route::SerialNode(path) => {
                info!("using serial node {} for {}", path.display(), address);
                self.open_serial(address, &path.to_string_lossy())
            }
            Route::Bluetooth(mac) => {
                info!("using direct bluetooth: {}:{}", mac, self.rfcomm_channel);
                let connector = BluetoothConnector {
                    channel: self.rfcomm_channel,
                    io_timeout: self.io_timeout,
                };
                let stream = connector.connect(&mac)?;
                Ok(Box::new(stream))
            }
            Route::SerialPath(path) => {
                info!("using serial port {}", path);
                self.open_serial(address, &path)
            }
        }
    }
}

/// Write a single control byte, treating a zero-length write as a failure.
pub(crate) fn send_byte(transport: &mut dyn Transport, byte: u8) -> std::result::Result<(), TransportError> {
    match transport.write(&[byte])? {
        0 => {
            warn!("control byte {:#04X} was not accepted by the transport", byte);
            Err(TransportError::new(
                TransportErrorKind::Unknown,
                "transport accepted 0 bytes",
            ))
        }
        _ => Ok(()),
    }
}
