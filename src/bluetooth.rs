use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use log::{debug, info};
use nix::sys::socket::{getsockopt, setsockopt, sockopt};
use nix::sys::time::TimeVal;

use crate::errors::{BluetoothError, DriverError, Result, TransportError, TransportErrorKind};
use crate::transport::{Transport, TransportKind, RFCOMM_CHANNEL};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;

/// Opens a raw RFCOMM socket to an already paired device. No root needed.
///
/// Pair and trust the device beforehand (e.g. with `bluetoothctl`).
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub channel: u8,
    /// Applied to connect, reads and writes.
    pub io_timeout: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self {
            channel: RFCOMM_CHANNEL,
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
        }
    }
}

impl BluetoothConnector {
    pub fn connect(&self, mac: &str) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(mac)?;
        let stream = open_rfcomm(bdaddr, self.channel, self.io_timeout)
            .map_err(|e| DriverError::connection(mac, e))?;
        stream.verify_connected().map_err(|e| DriverError::connection(mac, e))?;
        info!("RFCOMM connection established: mac={}, channel={}", mac, self.channel);
        Ok(stream)
    }
}

/// Blocking RFCOMM stream with socket-level read/write timeouts.
pub struct RfcommStream {
    file: File,
}

impl RfcommStream {
    /// Check the socket's pending error status.
    pub fn verify_connected(&self) -> std::result::Result<(), TransportError> {
        let err = getsockopt(&self.file, sockopt::SocketError)
            .map_err(|e| TransportError::from(std::io::Error::from(e)))?;
        if err != 0 {
            return Err(TransportError::from(std::io::Error::from_raw_os_error(err)));
        }
        Ok(())
    }
}

impl Transport for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        match self.file.read(buf) {
            // Receive timeouts surface as WouldBlock, so a zero-length read is EOF.
            Ok(0) if !buf.is_empty() => Err(TransportError::new(
                TransportErrorKind::Reset,
                "rfcomm peer closed the connection",
            )),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> std::result::Result<usize, TransportError> {
        let written = self.file.write(bytes)?;
        self.file.flush()?;
        Ok(written)
    }

    fn close(&mut self) {
        if unsafe { libc::shutdown(self.file.as_raw_fd(), libc::SHUT_RDWR) } < 0 {
            debug!("RFCOMM shutdown failed: {}", std::io::Error::last_os_error());
        }
        debug!("RFCOMM socket closed");
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct BdAddr {
    b: [u8; 6],
}

#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let invalid = || DriverError::Bluetooth(BluetoothError::InvalidAddress(mac.to_string()));

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    // bdaddr_t stores the octets in reverse order
    let mut addr = BdAddr { b: [0; 6] };
    for (i, part) in parts.iter().enumerate() {
        addr.b[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(addr)
}

fn last_os_error() -> TransportError {
    std::io::Error::last_os_error().into()
}

fn open_rfcomm(
    address: BdAddr,
    channel: u8,
    timeout: Duration,
) -> std::result::Result<RfcommStream, TransportError> {
    debug!(
        "opening RFCOMM socket: channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let raw = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
    if raw < 0 {
        return Err(last_os_error());
    }
    // From here on the descriptor is closed on every early return.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(last_os_error());
    }

    // SO_SNDTIMEO also bounds the blocking connect below.
    let tv = TimeVal::new(
        timeout.as_secs() as libc::time_t,
        timeout.subsec_micros() as libc::suseconds_t,
    );
    setsockopt(&fd, sockopt::ReceiveTimeout, &tv)
        .map_err(|e| TransportError::from(std::io::Error::from(e)))?;
    setsockopt(&fd, sockopt::SendTimeout, &tv)
        .map_err(|e| TransportError::from(std::io::Error::from(e)))?;

    let addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const SockAddrRc as *const libc::sockaddr,
            mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        // A blocking connect cut short by SO_SNDTIMEO reports EINPROGRESS.
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("rfcomm connect timed out after {:?}", timeout),
            ));
        }
        return Err(err.into());
    }

    Ok(RfcommStream {
        file: File::from(fd),
    })
}
