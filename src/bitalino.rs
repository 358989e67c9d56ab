//! BITalino connection: configuration bytes, streaming control and reads.
//!
//! A [`Bitalino`] owns exactly one transport and walks through
//! `Closed -> Open -> Streaming -> Open -> Closed`. Every control byte goes
//! through [`Bitalino::write`], which retries according to a [`RetryPolicy`].
//!
//! # Timing and Synchronization
//!
//! The device samples from its own crystal (1, 10, 100 or 1000 Hz). It does
//! not send timestamps, so timing must be reconstructed on the host:
//! - Bluetooth adds variable latency (typically 10-50ms)
//! - Data may arrive in bursts due to Bluetooth buffering
//! - The 4-bit sequence number (0-15) allows detection of dropped frames

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionBatch, FrameReader, ReadOptions, SampleMatrix};
use crate::codec::MAX_CHANNELS;
use crate::config::ConnectionConfig;
use crate::errors::{DriverError, Result};
use crate::retry::{RetryPolicy, RetryState};
use crate::transport::{send_byte, Connector, Transport, TransportKind};

const CMD_STOP: u8 = 0x00;

/// Highest value accepted by the battery threshold command.
pub const MAX_BATTERY_THRESHOLD: u8 = 63;

/// Supported sampling rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum SamplingRate {
    Hz1 = 1,
    Hz10 = 10,
    Hz100 = 100,
    #[default]
    Hz1000 = 1000,
}

impl SamplingRate {
    /// Two-bit rate code used in the configuration byte.
    pub fn code(self) -> u8 {
        match self {
            SamplingRate::Hz1 => 0b00,
            SamplingRate::Hz10 => 0b01,
            SamplingRate::Hz100 => 0b10,
            SamplingRate::Hz1000 => 0b11,
        }
    }

    /// `(code << 6) | 0x03`
    pub fn config_byte(self) -> u8 {
        (self.code() << 6) | 0x03
    }

    pub fn hz(self) -> u16 {
        self as u16
    }

    pub fn period_us(self) -> u64 {
        1_000_000 / (self as u64)
    }
}

impl TryFrom<u16> for SamplingRate {
    type Error = DriverError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(SamplingRate::Hz1),
            10 => Ok(SamplingRate::Hz10),
            100 => Ok(SamplingRate::Hz100),
            1000 => Ok(SamplingRate::Hz1000),
            _ => Err(DriverError::Configuration(format!(
                "invalid sampling rate {value}, supported: 1, 10, 100, 1000"
            ))),
        }
    }
}

impl From<SamplingRate> for u16 {
    fn from(rate: SamplingRate) -> Self {
        rate.hz()
    }
}

impl fmt::Display for SamplingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.hz())
    }
}

/// Distinct analog channel indices in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSet(Vec<u8>);

impl ChannelSet {
    /// Keeps the first occurrence of each index. Indices above 5 and empty
    /// sets are rejected.
    pub fn new(channels: &[u8]) -> Result<Self> {
        if let Some(bad) = channels.iter().find(|&&ch| ch as usize >= MAX_CHANNELS) {
            return Err(DriverError::Configuration(format!(
                "invalid analog channel {bad}, must be 0-5"
            )));
        }
        let mut set: Vec<u8> = Vec::with_capacity(channels.len());
        for &ch in channels {
            if !set.contains(&ch) {
                set.push(ch);
            }
        }
        if set.is_empty() {
            return Err(DriverError::Configuration(
                "at least one analog channel is required".into(),
            ));
        }
        Ok(Self(set))
    }

    /// A0 through A5.
    pub fn all() -> Self {
        Self((0..MAX_CHANNELS as u8).collect())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Start byte: live-mode bit plus one bit per channel from bit 2 up.
    pub fn mask(&self) -> u8 {
        self.0.iter().fold(0x01, |mask, &ch| mask | (1 << (2 + ch)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Closed,
    Open,
    Streaming,
}

/// A configured session with one device.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use bitalino_acq::{Bitalino, ConnectionConfig, SystemConnector};
///
/// let config = ConnectionConfig::default();
/// let connector = SystemConnector::new(&config);
/// let mut device = Bitalino::open(&connector, "98:D3:51:FE:6F:A3", 1000, &config)?;
/// device.start(&[0, 1, 2])?;
/// let matrix = device.read(1000, Duration::from_secs(5))?;
/// println!("{:?}", matrix.shape());
/// device.stop();
/// device.close();
/// # Ok::<(), bitalino_acq::DriverError>(())
/// ```
pub struct Bitalino {
    transport: Option<Box<dyn Transport>>,
    kind: TransportKind,
    address: String,
    sampling_rate: SamplingRate,
    channels: Option<ChannelSet>,
    reader: Option<FrameReader>,
    state: ConnectionState,
    config: ConnectionConfig,
}

impl Bitalino {
    /// Connect and send the sampling rate.
    ///
    /// The rate is checked before anything is connected. If the
    /// configuration byte cannot be written the transport is closed again.
    pub fn open(
        connector: &dyn Connector,
        address: &str,
        sampling_rate: u16,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let rate = SamplingRate::try_from(sampling_rate)?;
        let transport = connector.connect(address)?;

        let mut device = Self {
            kind: transport.kind(),
            transport: Some(transport),
            address: address.to_string(),
            sampling_rate: rate,
            channels: None,
            reader: None,
            state: ConnectionState::Open,
            config: config.clone(),
        };

        if let Err(e) = device.write(rate.config_byte(), config.write_policy) {
            warn!("configuring {} failed, closing: {}", address, e);
            device.close();
            return Err(e);
        }

        info!(
            "opened {} over {} at {}",
            device.address, device.kind, device.sampling_rate
        );
        Ok(device)
    }

    /// Send one control byte, retrying on transport failures.
    ///
    /// Returns the number of attempts it took.
    pub fn write(&mut self, byte: u8, policy: RetryPolicy) -> Result<u32> {
        let mut retry = RetryState::new(policy.max_attempts());
        loop {
            let attempt = retry.begin_attempt();
            let transport = self
                .transport
                .as_deref_mut()
                .ok_or_else(|| DriverError::NotOpen(self.address.clone()))?;

            match send_byte(transport, byte) {
                Ok(()) => {
                    debug!("sent {:#04X} on attempt {}", byte, attempt);
                    if !self.config.command_delay.is_zero() {
                        thread::sleep(self.config.command_delay);
                    }
                    return Ok(attempt);
                }
                Err(err) => {
                    retry.record_failure(err.kind.into());
                    if !retry.has_remaining() {
                        warn!(
                            "writing {:#04X} failed after {} attempts: {}",
                            byte, attempt, err
                        );
                        return Err(err.into());
                    }
                    let delay = retry.next_delay(policy.backoff);
                    warn!(
                        "writing {:#04X} failed (attempt {}/{}), retrying in {:?}: {}",
                        byte,
                        attempt,
                        retry.max_attempts(),
                        delay,
                        err
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Start streaming the given analog channels.
    ///
    /// An ongoing acquisition is stopped first.
    pub fn start(&mut self, channels: &[u8]) -> Result<()> {
        let set = ChannelSet::new(channels)?;
        if self.transport.is_none() {
            return Err(DriverError::NotOpen(self.address.clone()));
        }
        if self.state == ConnectionState::Streaming {
            self.stop();
        }

        let reader = FrameReader::new(set.len())?;
        let mask = set.mask();
        self.write(mask, self.config.channel_policy)?;

        debug!(
            "started acquisition: rate={}, channels={:?}, frame_size={}",
            self.sampling_rate,
            set.as_slice(),
            reader.frame_size()
        );
        self.channels = Some(set);
        self.reader = Some(reader);
        self.state = ConnectionState::Streaming;
        Ok(())
    }

    /// Read `n_samples` samples within `timeout`.
    pub fn read(&mut self, n_samples: usize, timeout: Duration) -> Result<SampleMatrix> {
        self.read_timed(n_samples, timeout).map(|batch| batch.matrix)
    }

    /// Like [`read`](Self::read), with timing and error statistics.
    pub fn read_timed(&mut self, n_samples: usize, timeout: Duration) -> Result<AcquisitionBatch> {
        let (Some(transport), Some(reader)) = (self.transport.as_deref_mut(), self.reader.as_mut())
        else {
            return Err(DriverError::NotReady(
                "acquisition not started, call start() first".into(),
            ));
        };
        let opts = ReadOptions::new(timeout).with_max_resync_bytes(self.config.max_resync_bytes);
        reader.read(transport, n_samples, &opts)
    }

    /// Send the stop byte. Never fails; returns whether the byte went out.
    pub fn stop(&mut self) -> bool {
        if self.transport.is_none() {
            return false;
        }
        let sent = match self.write(CMD_STOP, self.config.write_policy) {
            Ok(_) => true,
            Err(e) => {
                warn!("stop on {} failed: {}", self.address, e);
                false
            }
        };
        if self.state == ConnectionState::Streaming {
            self.state = ConnectionState::Open;
        }
        self.reader = None;
        sent
    }

    /// Release the transport. Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            info!("closed {} ({})", self.address, self.kind);
        }
        self.reader = None;
        self.state = ConnectionState::Closed;
    }

    /// Set the low-battery threshold (0-63) and read back the battery level.
    ///
    /// Returns `None` if the device does not answer within the io timeout
    /// or the reply cannot be read.
    pub fn battery(&mut self, threshold: u8) -> Result<Option<u8>> {
        if threshold > MAX_BATTERY_THRESHOLD {
            return Err(DriverError::Configuration(format!(
                "battery threshold {threshold} out of range 0-{MAX_BATTERY_THRESHOLD}"
            )));
        }
        if self.state == ConnectionState::Streaming {
            return Err(DriverError::NotReady(
                "cannot query battery during acquisition, call stop() first".into(),
            ));
        }

        self.write(threshold << 2, self.config.write_policy)?;

        let deadline = Instant::now() + self.config.io_timeout;
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or_else(|| DriverError::NotOpen(self.address.clone()))?;
        let mut byte = [0u8; 1];
        loop {
            match transport.read(&mut byte) {
                Ok(1) => {
                    let level = (byte[0] & 0x7F).min(100);
                    debug!("battery level {}% (threshold {})", level, threshold);
                    return Ok(Some(level));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("battery read from {} failed: {}", self.address, e);
                    return Ok(None);
                }
            }
            if Instant::now() >= deadline {
                debug!("no battery response from {}", self.address);
                return Ok(None);
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn sampling_rate(&self) -> SamplingRate {
        self.sampling_rate
    }

    pub fn channels(&self) -> Option<&ChannelSet> {
        self.channels.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Microseconds since streaming started.
    pub fn elapsed_us(&self) -> Option<u64> {
        self.reader.as_ref().map(FrameReader::elapsed_us)
    }
}

impl Drop for Bitalino {
    fn drop(&mut self) {
        if self.state == ConnectionState::Streaming {
            self.stop();
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::errors::{ErrorKind, TransportError, TransportErrorKind};
    use crate::retry::Backoff;
    use crate::simulator::SimulatedConnector;

    #[derive(Default)]
    struct WireLog {
        writes: Vec<u8>,
        attempts: usize,
        fail_next: usize,
        fail_reads: bool,
        closed: bool,
    }

    struct RecordingTransport(Arc<Mutex<WireLog>>);

    impl Transport for RecordingTransport {
        fn read(&mut self, _buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
            if self.0.lock().unwrap().fail_reads {
                return Err(TransportError::new(TransportErrorKind::Reset, "link dropped"));
            }
            Ok(0)
        }

        fn write(&mut self, bytes: &[u8]) -> std::result::Result<usize, TransportError> {
            let mut log = self.0.lock().unwrap();
            log.attempts += 1;
            if log.fail_next > 0 {
                log.fail_next -= 1;
                return Err(TransportError::new(TransportErrorKind::Reset, "link dropped"));
            }
            log.writes.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Serial
        }
    }

    #[derive(Default)]
    struct RecordingConnector {
        log: Arc<Mutex<WireLog>>,
        connects: AtomicUsize,
    }

    impl RecordingConnector {
        fn failing(writes: usize) -> Self {
            let connector = Self::default();
            connector.log.lock().unwrap().fail_next = writes;
            connector
        }

        fn writes(&self) -> Vec<u8> {
            self.log.lock().unwrap().writes.clone()
        }
    }

    impl Connector for RecordingConnector {
        fn connect(&self, _address: &str) -> Result<Box<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingTransport(self.log.clone())))
        }
    }

    fn fast_config() -> ConnectionConfig {
        let no_wait = Backoff::Fixed(Duration::ZERO);
        ConnectionConfig {
            command_delay: Duration::ZERO,
            io_timeout: Duration::from_millis(50),
            write_policy: RetryPolicy::new(1, no_wait),
            channel_policy: RetryPolicy::new(3, no_wait),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn invalid_rate_connects_nothing() {
        let connector = RecordingConnector::default();
        let result = Bitalino::open(&connector, "/dev/ttyUSB0", 7, &fast_config());
        match result {
            Err(e) => assert_eq!(e.kind(), ErrorKind::Configuration),
            Ok(_) => panic!("rate 7 must be rejected"),
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_sends_rate_byte() {
        for (rate, byte) in [(1000, 0xC3), (100, 0x83), (10, 0x43), (1, 0x03)] {
            let connector = RecordingConnector::default();
            let device = Bitalino::open(&connector, "/dev/ttyUSB0", rate, &fast_config()).unwrap();
            assert_eq!(device.state(), ConnectionState::Open);
            assert_eq!(connector.writes(), vec![byte]);
        }
    }

    #[test]
    fn start_sends_channel_mask() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        device.start(&[0, 1, 2]).unwrap();
        assert_eq!(connector.writes(), vec![0xC3, 0x1D]);
        assert_eq!(device.state(), ConnectionState::Streaming);
    }

    #[test]
    fn channel_set_dedupes_in_order() {
        let set = ChannelSet::new(&[2, 0, 2, 1]).unwrap();
        assert_eq!(set.as_slice(), &[2, 0, 1]);
        assert_eq!(set.mask(), 0x1D);
        assert_eq!(ChannelSet::all().mask(), 0xFD);
        assert!(ChannelSet::new(&[]).is_err());
        assert!(ChannelSet::new(&[0, 6]).is_err());
    }

    #[test]
    fn bad_channels_are_configuration_errors() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        let err = device.start(&[9]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(device.state(), ConnectionState::Open);
    }

    #[test]
    fn write_succeeds_after_transient_failures() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        connector.log.lock().unwrap().fail_next = 2;

        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::ZERO));
        assert_eq!(device.write(0x1D, policy).unwrap(), 3);
    }

    #[test]
    fn write_gives_up_after_all_retries() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        connector.log.lock().unwrap().fail_next = usize::MAX;
        let before = connector.log.lock().unwrap().attempts;

        let policy = RetryPolicy::new(2, Backoff::Fixed(Duration::ZERO));
        let err = device.write(0x1D, policy).unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert_eq!(connector.log.lock().unwrap().attempts - before, 3);
    }

    #[test]
    fn failed_configuration_closes_transport() {
        let connector = RecordingConnector::failing(usize::MAX);
        assert!(Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).is_err());
        let log = connector.log.lock().unwrap();
        assert!(log.closed);
        assert_eq!(log.attempts, 2);
    }

    #[test]
    fn stop_swallows_failures() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        device.start(&[0]).unwrap();
        connector.log.lock().unwrap().fail_next = usize::MAX;

        assert!(!device.stop());
        assert_eq!(device.state(), ConnectionState::Open);
    }

    #[test]
    fn close_is_idempotent_and_write_needs_open() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        device.close();
        device.close();
        assert_eq!(device.state(), ConnectionState::Closed);
        assert!(!device.stop());

        let err = device
            .write(0x00, RetryPolicy::new(0, Backoff::Fixed(Duration::ZERO)))
            .unwrap_err();
        assert!(matches!(err, DriverError::NotOpen(_)));
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn read_requires_streaming() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        assert!(matches!(
            device.read(1, Duration::from_millis(10)),
            Err(DriverError::NotReady(_))
        ));
    }

    #[test]
    fn drop_stops_and_closes() {
        let connector = RecordingConnector::default();
        {
            let mut device =
                Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
            device.start(&[0, 1]).unwrap();
        }
        assert_eq!(connector.writes(), vec![0xC3, 0x0D, 0x00]);
        assert!(connector.log.lock().unwrap().closed);
    }

    #[test]
    fn reads_from_simulated_device() {
        let connector = SimulatedConnector::new(false);
        let mut device = Bitalino::open(&connector, "sim", 1000, &fast_config()).unwrap();
        assert_eq!(device.elapsed_us(), None);
        device.start(ChannelSet::all().as_slice()).unwrap();

        let batch = device.read_timed(40, Duration::from_secs(1)).unwrap();
        assert_eq!(batch.matrix.shape(), (11, 40));
        assert_eq!(batch.resyncs, 0);
        assert_eq!(batch.sequence_gaps, 0);
        for i in 0..40 {
            assert_eq!(batch.matrix.column(i)[0], (i % 16) as u16);
        }
        assert!(device.elapsed_us().is_some());
        assert!(device.stop());
        assert_eq!(device.elapsed_us(), None);
    }

    #[test]
    fn battery_level_and_limits() {
        let connector = SimulatedConnector {
            realtime: false,
            battery_level: 64,
        };
        let mut device = Bitalino::open(&connector, "sim", 100, &fast_config()).unwrap();
        assert_eq!(device.battery(30).unwrap(), Some(64));
        assert!(matches!(device.battery(64), Err(DriverError::Configuration(_))));

        device.start(&[0]).unwrap();
        assert!(matches!(device.battery(10), Err(DriverError::NotReady(_))));
    }

    #[test]
    fn battery_without_answer_is_none() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        assert_eq!(device.battery(10).unwrap(), None);
        assert_eq!(connector.writes(), vec![0xC3, 40]);
    }

    #[test]
    fn battery_read_failure_is_none() {
        let connector = RecordingConnector::default();
        let mut device = Bitalino::open(&connector, "/dev/ttyUSB0", 1000, &fast_config()).unwrap();
        connector.log.lock().unwrap().fail_reads = true;

        assert_eq!(device.battery(10).unwrap(), None);
        assert_eq!(connector.writes(), vec![0xC3, 40]);
        assert!(device.is_open());
    }

    #[test]
    fn rate_codes_and_periods() {
        assert_eq!(SamplingRate::try_from(100).unwrap().config_byte(), 0x83);
        assert_eq!(SamplingRate::Hz10.period_us(), 100_000);
        assert_eq!(SamplingRate::Hz1000.to_string(), "1000Hz");
    }
}
