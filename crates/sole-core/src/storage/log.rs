//! Append-only record log with durable counters.

use log::warn;

use super::{
    ADDRESS_OFFSET_KEY, DATA_COUNT_KEY, MetaStore, RawStorage, SensorReading, StorageError,
};

/// Durable append-only log of [`SensorReading`] records.
///
/// Two counters describe the log: `record_count` (records appended since the
/// last clear) and `write_offset` (byte offset of the next free slot). The
/// invariant `write_offset == record_count × 39` is maintained here: both
/// counters move together on a successful append and never move on a failed
/// one, so a record is either fully present and counted or absent.
pub struct RecordLog<F, K> {
    flash: F,
    meta: K,
    record_count: u32,
    write_offset: u32,
}

impl<F, K> RecordLog<F, K>
where
    F: RawStorage,
    K: MetaStore,
{
    /// Opens the log, loading the durable counters.
    ///
    /// A fresh device has neither key stored and starts at zero. The record
    /// count is authoritative: if the stored write offset disagrees with it
    /// (a previous append wrote its record but died before the counter
    /// commit), the offset is recomputed so the orphaned bytes are
    /// overwritten by the next append.
    pub async fn open(flash: F, mut meta: K) -> Result<Self, StorageError> {
        let record_count = meta.get_u32(DATA_COUNT_KEY).await?.unwrap_or(0);
        let stored_offset = meta.get_u32(ADDRESS_OFFSET_KEY).await?.unwrap_or(0);

        let write_offset = record_count * SensorReading::SIZE as u32;
        if stored_offset != write_offset {
            warn!(
                "stored write offset {} does not match {} records, reconciling to {}",
                stored_offset, record_count, write_offset
            );
        }

        Ok(Self {
            flash,
            meta,
            record_count,
            write_offset,
        })
    }

    /// Number of records appended since the last clear.
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Byte offset of the next free slot in the region.
    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Appends one record and commits both counters.
    ///
    /// A failed raw write leaves the counters untouched. A failed counter
    /// commit after a successful raw write also leaves the in-memory
    /// counters untouched, so the next append rewrites the same slot and the
    /// count/offset invariant holds.
    pub async fn append(&mut self, reading: &SensorReading) -> Result<(), StorageError> {
        let frame = reading.encode();
        self.flash.write(self.write_offset, &frame).await?;

        let count = self.record_count + 1;
        let offset = self.write_offset + SensorReading::SIZE as u32;

        self.meta.set_u32(DATA_COUNT_KEY, count).await?;
        self.meta.set_u32(ADDRESS_OFFSET_KEY, offset).await?;
        self.meta.commit().await?;

        self.record_count = count;
        self.write_offset = offset;

        Ok(())
    }

    /// Reads the record at a 1-based index.
    pub async fn read_at(&mut self, index: u32) -> Result<SensorReading, StorageError> {
        if index < 1 || index > self.record_count {
            return Err(StorageError::OutOfRange {
                index,
                count: self.record_count,
            });
        }

        let mut frame = [0u8; SensorReading::SIZE];
        let offset = (index - 1) * SensorReading::SIZE as u32;
        self.flash.read(offset, &mut frame).await?;

        SensorReading::decode(&frame)
    }

    /// Erases the counters and the entire record region.
    ///
    /// Slow and irreversible; the caller decides when that is acceptable.
    pub async fn clear(&mut self) -> Result<(), StorageError> {
        self.meta.erase_key(DATA_COUNT_KEY).await?;
        self.meta.erase_key(ADDRESS_OFFSET_KEY).await?;
        self.meta.commit().await?;

        self.flash.erase().await?;

        self.record_count = 0;
        self.write_offset = 0;

        Ok(())
    }
}
