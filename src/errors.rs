use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

/// What went wrong at the transport level, as reported by the transport itself.
///
/// The arbiter decides on retries by matching on these kinds, so platform
/// specific error codes never leave this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportErrorKind {
    /// Nothing arrived (or nothing could be sent) within the configured timeout.
    Timeout,
    /// The link dropped under us: reset, broken pipe, EIO from the rfcomm layer.
    Reset,
    /// The device node or socket is held by someone else.
    Busy,
    /// The device is not there: missing node, refused or unreachable host.
    Unavailable,
    /// Anything we could not classify.
    Unknown,
}

impl TransportErrorKind {
    /// Classify an I/O error, looking at the raw errno first.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::EBUSY => return Self::Busy,
                libc::EIO | libc::ECONNRESET | libc::ECONNABORTED | libc::EPIPE | libc::ENOTCONN => {
                    return Self::Reset
                }
                libc::ETIMEDOUT | libc::EAGAIN => return Self::Timeout,
                libc::ENOENT
                | libc::ENODEV
                | libc::ENXIO
                | libc::ECONNREFUSED
                | libc::EHOSTDOWN
                | libc::EHOSTUNREACH
                | libc::EACCES => return Self::Unavailable,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::Reset,
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::PermissionDenied => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// Whether a fresh attempt has a reasonable chance of succeeding.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Reset | Self::Unknown)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Reset => "reset",
            Self::Busy => "busy",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::new(TransportErrorKind::from_io(&err), err.to_string())
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        let kind = if err.description.to_lowercase().contains("busy") {
            TransportErrorKind::Busy
        } else {
            match err.kind() {
                serialport::ErrorKind::NoDevice | serialport::ErrorKind::InvalidInput => {
                    TransportErrorKind::Unavailable
                }
                serialport::ErrorKind::Io(kind) => {
                    TransportErrorKind::from_io(&io::Error::from(kind))
                }
                _ => TransportErrorKind::Unknown,
            }
        };
        Self::new(kind, err.description)
    }
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),
    #[error("bluetooth unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("not open: {0}")]
    NotOpen(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("protocol desync: discarded {discarded} bytes without a valid frame")]
    ProtocolDesync { discarded: usize },
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("acquisition task failed: {0}")]
    Task(String),
}

impl DriverError {
    pub fn connection(address: &str, source: impl Into<TransportError>) -> Self {
        Self::Connection {
            address: address.to_string(),
            source: source.into(),
        }
    }

    /// The externally visible class of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::NotReady(_) => ErrorKind::Configuration,
            Self::NotOpen(_) | Self::Bluetooth(_) => ErrorKind::Connection,
            Self::Connection { source, .. } => match source.kind {
                TransportErrorKind::Timeout => ErrorKind::Timeout,
                TransportErrorKind::Busy => ErrorKind::DeviceBusy,
                _ => ErrorKind::Connection,
            },
            Self::Transport(err) => err.kind.into(),
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ProtocolDesync { .. } => ErrorKind::ProtocolDesync,
            Self::Task(_) => ErrorKind::TransientIo,
        }
    }

    /// Transient failures are worth a fresh open/start/read cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Transport(err) | Self::Connection { source: err, .. } => err.kind.is_transient(),
            _ => false,
        }
    }
}

/// Stable error taxonomy handed to whatever API sits above the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Bad sampling rate, channel set or call order. Never retried.
    Configuration,
    /// The transport could not be opened or the device went away.
    Connection,
    /// No data within the read deadline, or a connect/command timed out.
    Timeout,
    /// The device reported it is in use.
    DeviceBusy,
    /// Retryable low-level I/O failure that stayed after all attempts.
    TransientIo,
    /// The frame stream never realigned.
    ProtocolDesync,
}

impl ErrorKind {
    /// Suggested HTTP-style status for API layers.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Configuration => 400,
            Self::Connection => 503,
            Self::Timeout => 504,
            Self::DeviceBusy => 409,
            Self::TransientIo => 503,
            Self::ProtocolDesync => 502,
        }
    }
}

impl From<TransportErrorKind> for ErrorKind {
    fn from(kind: TransportErrorKind) -> Self {
        match kind {
            TransportErrorKind::Timeout => Self::Timeout,
            TransportErrorKind::Busy => Self::DeviceBusy,
            TransportErrorKind::Unavailable => Self::Connection,
            TransportErrorKind::Reset | TransportErrorKind::Unknown => Self::TransientIo,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
