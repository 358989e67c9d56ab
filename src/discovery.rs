//! Finding devices: serial ports that look like a BITalino and, with the
//! `bluez` feature, a short Bluetooth inquiry.

use std::path::Path;
use std::time::Duration;

use log::{debug, info};

use crate::errors::{BluetoothError, DriverError, Result, TransportError};
use crate::transport::is_mac_address;

#[cfg(feature = "bluez")]
use bluer::{AdapterEvent, Session};
#[cfg(feature = "bluez")]
use futures::StreamExt;

const PORT_HINTS: [&str; 3] = ["bitalino", "rfcomm", "com"];

fn is_candidate_port(name: &str) -> bool {
    let name = name.to_lowercase();
    PORT_HINTS.iter().any(|hint| name.contains(hint))
}

/// Serial ports whose name suggests a BITalino (rfcomm nodes, COM ports,
/// names containing "bitalino").
pub fn serial_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(TransportError::from)?;
    let names: Vec<String> = ports
        .into_iter()
        .map(|port| port.port_name)
        .filter(|name| is_candidate_port(name))
        .collect();
    debug!("candidate serial ports: {:?}", names);
    Ok(names)
}

/// Whether `address` can be reached right now.
///
/// Serial paths are checked on disk and in the port list. MAC addresses need
/// a Bluetooth scan lasting up to `scan`.
pub async fn is_present(address: &str, scan: Duration) -> Result<bool> {
    if !is_mac_address(address) {
        if Path::new(address).exists() {
            return Ok(true);
        }
        return Ok(serial_ports()?.iter().any(|port| port == address));
    }

    let found = scan_bluetooth(scan).await?;
    Ok(found.iter().any(|mac| mac.eq_ignore_ascii_case(address)))
}

/// Addresses of the Bluetooth devices seen during `duration`.
#[cfg(feature = "bluez")]
pub async fn scan_bluetooth(duration: Duration) -> Result<Vec<String>> {
    let unavailable = |e: bluer::Error| DriverError::Bluetooth(BluetoothError::Unavailable(e.to_string()));

    let session = Session::new().await.map_err(unavailable)?;
    let adapter = session.default_adapter().await.map_err(unavailable)?;
    adapter.set_powered(true).await.map_err(unavailable)?;

    info!("scanning for bluetooth devices on {} for {:?}", adapter.name(), duration);
    let mut events = adapter.discover_devices().await.map_err(unavailable)?;
    let deadline = tokio::time::Instant::now() + duration;

    let mut found = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
        if let AdapterEvent::DeviceAdded(addr) = event {
            let mac = addr.to_string();
            debug!("device discovered: mac={}", mac);
            if !found.contains(&mac) {
                found.push(mac);
            }
        }
    }
    Ok(found)
}

#[cfg(not(feature = "bluez"))]
pub async fn scan_bluetooth(_duration: Duration) -> Result<Vec<String>> {
    info!("bluetooth scan requested but built without the bluez feature");
    Err(DriverError::Bluetooth(BluetoothError::Unavailable(
        "built without the `bluez` feature".into(),
    )))
}
