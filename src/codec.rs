//! BITalino frame layout, checksum and sample extraction.
//!
//! A frame carries one multiplexed sample for every active channel. It is read
//! from the end: the last byte holds the sequence number (high nibble) and the
//! checksum (low nibble), the byte before it holds the four digital inputs in
//! its high nibble, and the analog channels are packed backwards from there.
//! The first four analog channels are 10 bits wide, A4 and A5 only 6 bits.

use serde::Serialize;

/// Number of analog channels on the device.
pub const MAX_CHANNELS: usize = 6;

/// Rows preceding the analog values in a decoded sample: sequence + 4 digital.
pub const HEADER_ROWS: usize = 5;

/// One extraction step: `(bytes from the end of the frame, mask, shift)`.
///
/// A positive shift moves the masked bits left, a negative one right.
type Part = (usize, u8, i8);

const ANALOG_RULES: [&[Part]; MAX_CHANNELS] = [
    &[(2, 0x0F, 6), (3, 0xFC, -2)], // A0
    &[(3, 0x03, 8), (4, 0xFF, 0)],  // A1
    &[(5, 0xFF, 2), (6, 0xC0, -6)], // A2
    &[(6, 0x3F, 4), (7, 0xF0, -4)], // A3
    &[(7, 0x0F, 2), (8, 0xC0, -6)], // A4
    &[(8, 0x3F, 0)],                // A5
];

/// A decoded frame: `[seqN, D0, D1, D2, D3, A0..A(n-1)]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Sequence number (0-15, wraps around).
    pub seq: u8,
    /// Digital inputs D0..D3, each 0 or 1.
    pub digital: [u8; 4],
    /// Raw ADC codes for the active analog channels.
    pub analog: Vec<u16>,
}

impl Sample {
    #[inline]
    pub fn new(seq: u8, digital: [u8; 4], analog: Vec<u16>) -> Self {
        Self {
            seq,
            digital,
            analog,
        }
    }

    pub fn n_channels(&self) -> usize {
        self.analog.len()
    }

    /// Values in matrix row order.
    pub fn values(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.seq as u16)
            .chain(self.digital.iter().map(|&d| d as u16))
            .chain(self.analog.iter().copied())
    }

    pub fn to_vec(&self) -> Vec<u16> {
        self.values().collect()
    }
}

/// Frame size in bytes for `n_channels` active analog channels.
pub fn frame_size(n_channels: usize) -> usize {
    let bits = if n_channels <= 4 {
        12 + 10 * n_channels
    } else {
        52 + 6 * (n_channels - 4)
    };
    bits.div_ceil(8)
}

/// Compute the 4-bit checksum of a frame.
///
/// Every bit is shifted MSB first through a 4-stage register `x3 x2 x1 x0`.
/// The low nibble of the last byte holds the stored checksum, so those four
/// input bits count as zero.
pub fn checksum(frame: &[u8]) -> u8 {
    let last = frame.len().saturating_sub(1);
    let mut reg = 0u8;
    for (i, &byte) in frame.iter().enumerate() {
        let byte = if i == last { byte & 0xF0 } else { byte };
        for bit in (0..8).rev() {
            let out = (reg >> 3) & 0x01;
            reg = ((reg << 1) & 0x0F) ^ (out * 0x03) ^ ((byte >> bit) & 0x01);
        }
    }
    reg
}

/// Check the stored checksum nibble against the computed one.
pub fn validate(frame: &[u8]) -> bool {
    match frame.last() {
        Some(&last) => checksum(frame) == last & 0x0F,
        None => false,
    }
}

/// Decode one frame. Returns `None` when the checksum does not match or the
/// frame length does not fit `n_channels`.
pub fn decode(frame: &[u8], n_channels: usize) -> Option<Sample> {
    if n_channels == 0 || n_channels > MAX_CHANNELS || frame.len() != frame_size(n_channels) {
        return None;
    }
    if !validate(frame) {
        return None;
    }

    let at = |from_end: usize| frame[frame.len() - from_end];

    let seq = at(1) >> 4;
    let digital_byte = at(2);
    let digital = [
        (digital_byte >> 7) & 0x01,
        (digital_byte >> 6) & 0x01,
        (digital_byte >> 5) & 0x01,
        (digital_byte >> 4) & 0x01,
    ];

    let analog = ANALOG_RULES[..n_channels]
        .iter()
        .map(|parts| {
            parts.iter().fold(0u16, |value, &(from_end, mask, shift)| {
                let masked = (at(from_end) & mask) as u16;
                if shift >= 0 {
                    value | (masked << shift)
                } else {
                    value | (masked >> -shift)
                }
            })
        })
        .collect();

    Some(Sample::new(seq, digital, analog))
}

/// Build a frame for `sample`, checksum included. Values wider than their
/// channel are truncated to the packed width.
///
/// # Panics
/// If the sample has no analog channels or more than [`MAX_CHANNELS`].
pub fn encode(sample: &Sample) -> Vec<u8> {
    let n = sample.n_channels();
    assert!(
        (1..=MAX_CHANNELS).contains(&n),
        "sample must carry 1-6 analog channels, got {n}"
    );

    let size = frame_size(n);
    let mut frame = vec![0u8; size];

    frame[size - 1] = (sample.seq & 0x0F) << 4;
    for (i, &bit) in sample.digital.iter().enumerate() {
        frame[size - 2] |= (bit & 0x01) << (7 - i);
    }

    for (value, parts) in sample.analog.iter().zip(ANALOG_RULES.iter()) {
        for &(from_end, mask, shift) in parts.iter() {
            let bits = if shift >= 0 {
                value >> shift
            } else {
                value << -shift
            };
            frame[size - from_end] |= (bits as u8) & mask;
        }
    }

    frame[size - 1] |= checksum(&frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_follow_packing() {
        let sizes: Vec<usize> = (1..=6).map(frame_size).collect();
        assert_eq!(sizes, vec![3, 4, 6, 7, 8, 8]);
    }

    #[test]
    fn decodes_literal_two_channel_frame() {
        let frame = [0x00, 0x00, 0xA8, 0x5D];
        let sample = decode(&frame, 2).expect("valid frame");
        assert_eq!(sample.to_vec(), vec![5, 1, 0, 1, 0, 512, 0]);
    }

    #[test]
    fn flipped_checksum_fails_validation() {
        let mut frame = [0x00, 0x00, 0xA8, 0x5D];
        assert!(validate(&frame));

        frame[3] ^= 0x0F;
        assert!(!validate(&frame));
        assert!(decode(&frame, 2).is_none());

        frame[3] = (frame[3] & 0xF0) | checksum(&frame);
        assert!(validate(&frame));
    }

    #[test]
    fn checksum_ignores_stored_nibble() {
        let a = [0x12, 0x34, 0x56, 0x70];
        let b = [0x12, 0x34, 0x56, 0x7F];
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn six_channel_frame() {
        let sample = Sample::new(7, [0, 1, 1, 0], vec![1023, 1, 600, 77, 63, 42]);
        let frame = encode(&sample);
        assert_eq!(frame, vec![0xEA, 0xDF, 0x04, 0x96, 0x01, 0xFC, 0x6F, 0x73]);
        assert_eq!(decode(&frame, 6), Some(sample));
    }

    #[test]
    fn narrow_channels_are_truncated() {
        let sample = Sample::new(0, [0; 4], vec![0, 0, 0, 0, 0x7F, 0xFF]);
        let decoded = decode(&encode(&sample), 6).expect("valid frame");
        assert_eq!(decoded.analog[4], 0x3F);
        assert_eq!(decoded.analog[5], 0x3F);
    }

    #[test]
    fn rejects_wrong_length() {
        let frame = [0x00, 0x00, 0xA8, 0x5D];
        assert!(decode(&frame, 3).is_none());
        assert!(decode(&frame[..3], 2).is_none());
        assert!(decode(&[], 1).is_none());
        assert!(!validate(&[]));
    }

    #[test]
    fn constant_filler_never_validates() {
        for n in 1..=MAX_CHANNELS {
            let frame = vec![0xFF; frame_size(n)];
            assert!(!validate(&frame), "n={n}");
        }
    }
}
