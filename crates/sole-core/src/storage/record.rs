//! Binary record format for persisted and transmitted samples.
//!
//! One record is 39 bytes, fixed layout, little-endian:
//! - bytes 0..3: packed header — 24-bit sequence (low byte first) + 8-bit flag
//! - bytes 4..8: timestamp (u32, seconds since epoch)
//! - bytes 8..39: one temperature code per channel
//!
//! There is no padding and no version field; any layout change breaks
//! previously stored data.

use super::{CHANNEL_COUNT, StorageError};

/// Record carries a freshly acquired sample.
pub const FLAG_LIVE: u8 = 11;
/// Record is a replay of a previously stored sample.
pub const FLAG_REPLAYED: u8 = 12;
/// Synthetic record announcing the stored record count to a new subscriber.
pub const FLAG_COUNT: u8 = 22;

/// The sequence field occupies the low 24 bits of the packed header.
pub const SEQUENCE_MASK: u32 = 0x00FF_FFFF;

/// One timestamped multi-channel sample.
///
/// `sequence` is kept in a `u32` but only its low 24 bits are encoded; it
/// wraps at 2^24 on the wire. Temperature codes are `2 × °C` with bit 0
/// holding the half-degree bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    pub sequence: u32,
    pub flag: u8,
    pub timestamp: u32,
    pub values: [u8; CHANNEL_COUNT],
}

impl SensorReading {
    /// Encoded size in bytes (header + timestamp + one byte per channel).
    pub const SIZE: usize = 4 + 4 + CHANNEL_COUNT;

    /// Creates a live record from a completed acquisition cycle.
    pub fn live(sequence: u32, timestamp: u32, values: [u8; CHANNEL_COUNT]) -> Self {
        Self {
            sequence,
            flag: FLAG_LIVE,
            timestamp,
            values,
        }
    }

    /// Creates the synthetic count announcement sent when a peer subscribes.
    ///
    /// The count rides in the sequence field and, for convenience of peers
    /// that only look at the payload, in the first four value bytes as well.
    pub fn count_announcement(record_count: u32) -> Self {
        let mut values = [0u8; CHANNEL_COUNT];
        values[..4].copy_from_slice(&record_count.to_le_bytes());

        Self {
            sequence: record_count & SEQUENCE_MASK,
            flag: FLAG_COUNT,
            timestamp: 0,
            values,
        }
    }

    /// Encodes the record into its 39-byte wire/storage form.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];

        let header = (self.sequence & SEQUENCE_MASK) | ((self.flag as u32) << 24);
        bytes[0..4].copy_from_slice(&header.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8..].copy_from_slice(&self.values);

        bytes
    }

    /// Decodes a record from exactly [`Self::SIZE`] bytes.
    ///
    /// A buffer of any other length is rejected; the codec never truncates
    /// or pads.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != Self::SIZE {
            return Err(StorageError::MalformedRecord { len: bytes.len() });
        }

        let mut header = [0u8; 4];
        header.copy_from_slice(&bytes[0..4]);
        let header = u32::from_le_bytes(header);

        let mut timestamp = [0u8; 4];
        timestamp.copy_from_slice(&bytes[4..8]);
        let timestamp = u32::from_le_bytes(timestamp);

        let mut values = [0u8; CHANNEL_COUNT];
        values.copy_from_slice(&bytes[8..]);

        Ok(Self {
            sequence: header & SEQUENCE_MASK,
            flag: (header >> 24) as u8,
            timestamp,
            values,
        })
    }
}
