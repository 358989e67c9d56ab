//! Blocking acquisition loop: pulls bytes from a transport, realigns on
//! checksum failures and fills a sample matrix column by column.
//!
//! # Timing
//!
//! The device does not send timestamps. Sample times have to be rebuilt on the
//! host as `start + column / sampling_rate`; the 4-bit sequence number is the
//! only way to notice dropped frames, and it wraps every 16 samples.

use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use ndarray::{Array2, ArrayView1};
use serde::Serialize;

use crate::codec::{self, Sample, HEADER_ROWS, MAX_CHANNELS};
use crate::errors::{DriverError, Result};
use crate::transport::Transport;

/// Decoded samples, one column per sample, rows `[seqN, D0..D3, A..]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SampleMatrix(Array2<u16>);

impl SampleMatrix {
    pub fn zeros(n_channels: usize, n_samples: usize) -> Self {
        Self(Array2::zeros((HEADER_ROWS + n_channels, n_samples)))
    }

    /// `(rows, columns)` = `(5 + n_channels, n_samples)`.
    pub fn shape(&self) -> (usize, usize) {
        self.0.dim()
    }

    pub fn n_channels(&self) -> usize {
        self.0.nrows() - HEADER_ROWS
    }

    pub fn n_samples(&self) -> usize {
        self.0.ncols()
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, u16> {
        self.0.column(index)
    }

    pub fn set_column(&mut self, index: usize, sample: &Sample) {
        for (cell, value) in self.0.column_mut(index).iter_mut().zip(sample.values()) {
            *cell = value;
        }
    }

    pub fn as_array(&self) -> &Array2<u16> {
        &self.0
    }

    pub fn into_array(self) -> Array2<u16> {
        self.0
    }
}

/// Row names for a matrix acquired on `channels`, e.g. `seqN, D0.., A0, A3`.
///
/// The device packs active channels in index order whatever order they were
/// requested in.
pub fn row_labels(channels: &[u8]) -> Vec<String> {
    let mut sorted = channels.to_vec();
    sorted.sort_unstable();
    let mut labels = vec!["seqN".to_string()];
    labels.extend((0..4).map(|i| format!("D{i}")));
    labels.extend(sorted.iter().map(|ch| format!("A{ch}")));
    labels
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Deadline for the whole call, started on entry.
    pub timeout: Duration,
    /// Give up with [`DriverError::ProtocolDesync`] once more bytes than this
    /// were dropped while realigning.
    pub max_resync_bytes: Option<usize>,
}

impl ReadOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_resync_bytes: None,
        }
    }

    pub fn with_max_resync_bytes(mut self, max: Option<usize>) -> Self {
        self.max_resync_bytes = max;
        self
    }
}

/// Result of a read, with timing and error statistics.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionBatch {
    pub matrix: SampleMatrix,
    /// Microseconds between `start()` and the beginning of this read.
    pub timestamp_us: u64,
    /// Bytes dropped because the buffered frame failed its checksum.
    pub resyncs: usize,
    /// Frames presumed lost, from sequence number jumps.
    pub sequence_gaps: usize,
}

/// Per-stream reader state. Created when streaming starts so the sequence
/// number can be followed across reads.
#[derive(Debug, Clone)]
pub struct FrameReader {
    n_channels: usize,
    frame_size: usize,
    started: Instant,
    last_seq: Option<u8>,
}

impl FrameReader {
    pub fn new(n_channels: usize) -> Result<Self> {
        if n_channels == 0 || n_channels > MAX_CHANNELS {
            return Err(DriverError::Configuration(format!(
                "channel count must be 1-{MAX_CHANNELS}, got {n_channels}"
            )));
        }
        Ok(Self {
            n_channels,
            frame_size: codec::frame_size(n_channels),
            started: Instant::now(),
            last_seq: None,
        })
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn elapsed_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    /// Read exactly `n_samples` valid frames before the deadline.
    ///
    /// Each failed decode drops one leading byte and tries again without
    /// resetting the deadline. The deadline is checked whenever a pull comes
    /// back empty and after every failed decode, so a stream of garbage still
    /// ends in [`DriverError::Timeout`].
    pub fn read(
        &mut self,
        transport: &mut dyn Transport,
        n_samples: usize,
        opts: &ReadOptions,
    ) -> Result<AcquisitionBatch> {
        if n_samples == 0 {
            return Err(DriverError::Configuration(
                "number of samples must be positive".into(),
            ));
        }
        if opts.timeout.is_zero() {
            return Err(DriverError::Configuration("timeout must be positive".into()));
        }

        let timestamp_us = self.elapsed_us();
        let deadline = Instant::now() + opts.timeout;
        let size = self.frame_size;

        let mut matrix = SampleMatrix::zeros(self.n_channels, n_samples);
        let mut buffer: Vec<u8> = Vec::with_capacity(size);
        let mut chunk = vec![0u8; size];
        let mut filled = 0usize;
        let mut resyncs = 0usize;
        let mut sequence_gaps = 0usize;

        let timed_out = |filled: usize| {
            DriverError::Timeout(format!(
                "got {filled} of {n_samples} samples within {:?}",
                opts.timeout
            ))
        };

        while filled < n_samples {
            if buffer.len() < size {
                let wanted = size - buffer.len();
                let got = transport.read(&mut chunk[..wanted])?;
                if got == 0 {
                    if Instant::now() >= deadline {
                        return Err(timed_out(filled));
                    }
                    continue;
                }
                buffer.extend_from_slice(&chunk[..got]);
                continue;
            }

            match codec::decode(&buffer, self.n_channels) {
                Some(sample) => {
                    sequence_gaps += self.track_sequence(sample.seq);
                    matrix.set_column(filled, &sample);
                    filled += 1;
                    buffer.clear();
                }
                None => {
                    trace!("checksum mismatch, dropping {:#04X}", buffer[0]);
                    buffer.remove(0);
                    resyncs += 1;
                    if let Some(max) = opts.max_resync_bytes {
                        if resyncs > max {
                            return Err(DriverError::ProtocolDesync { discarded: resyncs });
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(timed_out(filled));
                    }
                }
            }
        }

        if resyncs > 0 {
            warn!("resynchronized {} times in batch (suppressing per-frame logs)", resyncs);
        }
        if sequence_gaps > 0 {
            warn!("sequence gaps detected in batch: {}", sequence_gaps);
        }
        debug!(
            "read {} samples of {} channels at t={}us",
            n_samples, self.n_channels, timestamp_us
        );

        Ok(AcquisitionBatch {
            matrix,
            timestamp_us,
            resyncs,
            sequence_gaps,
        })
    }

    /// Number of frames presumed lost before `seq`.
    fn track_sequence(&mut self, seq: u8) -> usize {
        let mut gap = 0;
        if let Some(last) = self.last_seq {
            let expected = (last + 1) & 0x0F;
            if seq != expected {
                let jump = ((seq as i16 - expected as i16 + 16) % 16) as usize;
                // Larger jumps look like a restart rather than loss.
                if jump > 0 && jump < 8 {
                    gap = jump;
                }
            }
        }
        self.last_seq = Some(seq);
        gap
    }
}
