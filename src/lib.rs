//! BITalino acquisition core.
//!
//! Talks to BITalino biosignal devices over a serial node or a direct
//! Bluetooth RFCOMM socket (no root privileges required), decodes the
//! bit-packed frame stream and arbitrates concurrent acquisitions so each
//! device serves one session at a time.
//!
//! # Timing and Synchronization
//!
//! The BITalino device samples at a precise rate controlled by its internal crystal.
//! However, Bluetooth introduces variable latency. For accurate timing reconstruction:
//!
//! 1. Record the start time when calling `start()`
//! 2. Use sequence numbers to detect dropped frames
//! 3. Calculate sample times as: `start_time + sample_index / sampling_rate`

pub mod acquisition;
pub mod arbiter;
pub mod bitalino;
pub mod bluetooth;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod logging;
pub mod retry;
pub mod simulator;
pub mod transport;

pub use acquisition::{row_labels, AcquisitionBatch, FrameReader, ReadOptions, SampleMatrix};
pub use arbiter::{
    Acquisition, AcquisitionError, AcquisitionRequest, Arbiter, DeviceLease, DeviceLockTable,
};
pub use bitalino::{Bitalino, ChannelSet, ConnectionState, SamplingRate};
pub use bluetooth::{BluetoothConnector, RfcommStream};
pub use codec::{frame_size, Sample};
pub use config::{ArbiterConfig, ConnectionConfig};
pub use errors::*;
pub use retry::{Backoff, RetryPolicy, RetryState};
pub use simulator::{SimulatedConnector, SimulatedTransport};
pub use transport::{Connector, SerialTransport, SystemConnector, Transport, TransportKind};
