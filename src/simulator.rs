//! In-memory device that speaks the control-byte protocol.
//!
//! It answers the same bytes a real unit does: rate configuration, the
//! channel mask that starts streaming, stop and the battery threshold. While
//! streaming it produces checksum-valid frames with a wrapping sequence
//! number and synthetic analog ramps.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::codec::{self, Sample};
use crate::errors::{Result, TransportError, TransportErrorKind};
use crate::transport::{Connector, Transport, TransportKind};

const RATES_HZ: [u32; 4] = [1, 10, 100, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Streaming { n_channels: usize },
}

pub struct SimulatedTransport {
    mode: Mode,
    rate_hz: u32,
    pending: VecDeque<u8>,
    emitted: u64,
    battery_level: u8,
    realtime: bool,
    next_due: Option<Instant>,
    poll_interval: Duration,
    closed: bool,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            mode: Mode::Idle,
            rate_hz: 1000,
            pending: VecDeque::new(),
            emitted: 0,
            battery_level: 87,
            realtime: false,
            next_due: None,
            poll_interval: Duration::from_millis(5),
            closed: false,
        }
    }

    /// Level (0-100) reported in reply to a battery command.
    pub fn with_battery_level(mut self, level: u8) -> Self {
        self.battery_level = level.min(100);
        self
    }

    /// Emit frames no faster than the configured sampling rate.
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    /// How long an idle read waits before reporting that nothing arrived.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.mode, Mode::Streaming { .. })
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    fn handle_command(&mut self, byte: u8) {
        match self.mode {
            Mode::Streaming { .. } if byte == 0x00 => {
                debug!("simulator: stop after {} frames", self.emitted);
                self.mode = Mode::Idle;
                self.pending.clear();
            }
            Mode::Streaming { .. } => {
                debug!("simulator: ignoring {:#04X} while streaming", byte);
            }
            Mode::Idle => match byte & 0x03 {
                0x03 if byte & 0x3C == 0 => {
                    self.rate_hz = RATES_HZ[(byte >> 6) as usize];
                    debug!("simulator: rate set to {}Hz", self.rate_hz);
                }
                0x01 => {
                    let n_channels = (byte >> 2).count_ones() as usize;
                    if n_channels == 0 {
                        debug!("simulator: start without channels ignored");
                        return;
                    }
                    self.mode = Mode::Streaming { n_channels };
                    self.pending.clear();
                    self.emitted = 0;
                    self.next_due = None;
                    debug!("simulator: streaming {} channels", n_channels);
                }
                0x00 => {
                    debug!("simulator: battery threshold {}", byte >> 2);
                    self.pending.push_back(self.battery_level);
                }
                _ => debug!("simulator: unsupported command {:#04X}", byte),
            },
        }
    }

    fn next_frame(&mut self, n_channels: usize) -> Vec<u8> {
        let t = self.emitted;
        let analog = (0..n_channels)
            .map(|ch| ((t * (ch as u64 + 1) * 7 + ch as u64 * 150) % 1024) as u16)
            .collect();
        let digital = [
            ((t >> 4) & 1) as u8,
            ((t >> 5) & 1) as u8,
            ((t >> 6) & 1) as u8,
            ((t >> 7) & 1) as u8,
        ];
        self.emitted += 1;
        codec::encode(&Sample::new((t % 16) as u8, digital, analog))
    }

    fn pace(&mut self) {
        if !self.realtime {
            return;
        }
        let period = Duration::from_secs(1) / self.rate_hz;
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due + period);
    }
}

impl Transport for SimulatedTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::new(
                TransportErrorKind::Reset,
                "simulated device is closed",
            ));
        }
        if self.pending.is_empty() {
            match self.mode {
                Mode::Streaming { n_channels } => {
                    self.pace();
                    let frame = self.next_frame(n_channels);
                    self.pending.extend(frame);
                }
                Mode::Idle => {
                    std::thread::sleep(self.poll_interval);
                    return Ok(0);
                }
            }
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8]) -> std::result::Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::new(
                TransportErrorKind::Reset,
                "simulated device is closed",
            ));
        }
        for &byte in bytes {
            self.handle_command(byte);
        }
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.closed = true;
        self.mode = Mode::Idle;
        self.pending.clear();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }
}

/// Hands out a fresh [`SimulatedTransport`] for any address.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    pub realtime: bool,
    pub battery_level: u8,
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self {
            realtime: true,
            battery_level: 87,
        }
    }
}

impl SimulatedConnector {
    pub fn new(realtime: bool) -> Self {
        Self {
            realtime,
            ..Self::default()
        }
    }
}

impl Connector for SimulatedConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn Transport>> {
        info!("connecting to simulated device for {}", address);
        Ok(Box::new(
            SimulatedTransport::new()
                .realtime(self.realtime)
                .with_battery_level(self.battery_level),
        ))
    }
}
