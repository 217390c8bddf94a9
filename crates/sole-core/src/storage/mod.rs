//! Persistent record storage: the append-only log and its collaborators.
//!
//! The actual flash region and durable key-value store are external to this
//! crate; [`RawStorage`] and [`MetaStore`] describe exactly what the engine
//! needs from them.

pub mod log;
pub mod record;

pub use log::RecordLog;
pub use record::{FLAG_COUNT, FLAG_LIVE, FLAG_REPLAYED, SensorReading};

use thiserror_no_std::Error;

/// Number of temperature channels in the insole array.
pub const CHANNEL_COUNT: usize = 31;

/// Key-value key holding the number of stored records.
pub const DATA_COUNT_KEY: &str = "data_count";
/// Key-value key holding the byte offset of the next free log slot.
pub const ADDRESS_OFFSET_KEY: &str = "address_offset";

/// Storage failures, kept small and `Copy` so they can cross task loops
/// without allocation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("write to raw storage region failed")]
    WriteFailed,
    #[error("read from raw storage region failed")]
    ReadFailed,
    #[error("erase of raw storage region failed")]
    EraseFailed,
    #[error("durable counter commit failed")]
    CommitFailed,
    #[error("record index {index} out of range, {count} records stored")]
    OutOfRange { index: u32, count: u32 },
    #[error("record buffer of {len} bytes does not match the record size")]
    MalformedRecord { len: usize },
}

/// Byte-addressable append target backing the record log.
///
/// Offsets are relative to the start of the log region. The region must hold
/// at least as many bytes as the device is expected to record; exhaustion
/// surfaces as [`StorageError::WriteFailed`].
pub trait RawStorage {
    fn write(
        &mut self,
        offset: u32,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), StorageError>>;
    fn read(
        &mut self,
        offset: u32,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(), StorageError>>;
    /// Bulk-erases the entire region. Slow and destructive.
    fn erase(&mut self) -> impl Future<Output = Result<(), StorageError>>;
}

/// Durable key-value store for the log counters.
///
/// Writes become durable at `commit`. Erasing a key that does not exist is
/// not an error.
pub trait MetaStore {
    fn get_u32(&mut self, key: &str) -> impl Future<Output = Result<Option<u32>, StorageError>>;
    fn set_u32(&mut self, key: &str, value: u32)
    -> impl Future<Output = Result<(), StorageError>>;
    fn erase_key(&mut self, key: &str) -> impl Future<Output = Result<(), StorageError>>;
    fn commit(&mut self) -> impl Future<Output = Result<(), StorageError>>;
}
