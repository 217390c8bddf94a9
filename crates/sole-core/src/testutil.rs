//! In-memory fakes for every collaborator trait, shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use embedded_hal_async::i2c::{ErrorKind, ErrorType, I2c, Operation};

use crate::clock::Clock;
use crate::engine::EngineState;
use crate::sensors::SENSOR_ADDRESSES;
use crate::sensors::max31725::{CONFIG_ONE_SHOT, REG_CONFIGURATION, REG_TEMPERATURE};
use crate::storage::{
    CHANNEL_COUNT, MetaStore, RawStorage, RecordLog, SensorReading, StorageError,
};
use crate::transport::RecordSink;

/// Builds an [`EngineState`] over fresh fakes with `records` samples already
/// stored (sequence 1..=records).
pub async fn engine_state(records: u32) -> EngineState<FakeFlash, FakeNvs> {
    let mut log = RecordLog::open(FakeFlash::new(8192), FakeNvs::new())
        .await
        .unwrap();

    for sequence in 1..=records {
        let reading = SensorReading::live(
            sequence,
            1_700_000_000 + sequence,
            [(2 * sequence) as u8; CHANNEL_COUNT],
        );
        log.append(&reading).await.unwrap();
    }

    EngineState::new(log)
}

// ---------------------------------------------------------------------------
// Raw storage region
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FlashInner {
    data: Vec<u8>,
    fail_writes: bool,
    fail_reads: bool,
}

/// Byte-array flash region. Clones share the same backing store, so a test
/// can keep a handle while the log owns another.
#[derive(Clone, Default)]
pub struct FakeFlash(Rc<RefCell<FlashInner>>);

impl FakeFlash {
    pub fn new(size: usize) -> Self {
        Self(Rc::new(RefCell::new(FlashInner {
            data: vec![0xFF; size],
            fail_writes: false,
            fail_reads: false,
        })))
    }

    pub fn fail_writes(&self, fail: bool) {
        self.0.borrow_mut().fail_writes = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.0.borrow_mut().fail_reads = fail;
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().data.clone()
    }
}

impl RawStorage for FakeFlash {
    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.0.borrow_mut();
        let offset = offset as usize;

        if inner.fail_writes || offset + bytes.len() > inner.data.len() {
            return Err(StorageError::WriteFailed);
        }

        inner.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let inner = self.0.borrow();
        let offset = offset as usize;

        if inner.fail_reads || offset + buf.len() > inner.data.len() {
            return Err(StorageError::ReadFailed);
        }

        buf.copy_from_slice(&inner.data[offset..offset + buf.len()]);
        Ok(())
    }

    async fn erase(&mut self) -> Result<(), StorageError> {
        let mut inner = self.0.borrow_mut();
        inner.data.fill(0xFF);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Durable key-value store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NvsInner {
    map: BTreeMap<String, u32>,
    fail_commits: bool,
}

/// Key-value store with immediate writes and an optionally failing commit.
#[derive(Clone, Default)]
pub struct FakeNvs(Rc<RefCell<NvsInner>>);

impl FakeNvs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.0.borrow_mut().fail_commits = fail;
    }

    pub fn seed(&self, key: &str, value: u32) {
        self.0.borrow_mut().map.insert(key.into(), value);
    }
}

impl MetaStore for FakeNvs {
    async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        Ok(self.0.borrow().map.get(key).copied())
    }

    async fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.0.borrow_mut().map.insert(key.into(), value);
        Ok(())
    }

    async fn erase_key(&mut self, key: &str) -> Result<(), StorageError> {
        self.0.borrow_mut().map.remove(key);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if self.0.borrow().fail_commits {
            return Err(StorageError::CommitFailed);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock and notification sink
// ---------------------------------------------------------------------------

/// Settable clock frozen between `set` calls.
pub struct FakeClock(Cell<u32>);

impl FakeClock {
    pub fn new(epoch: u32) -> Self {
        Self(Cell::new(epoch))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u32 {
        self.0.get()
    }

    fn set(&self, epoch: u32) {
        self.0.set(epoch);
    }
}

/// Captures every published frame.
#[derive(Default)]
pub struct FakeSink(RefCell<Vec<[u8; SensorReading::SIZE]>>);

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<[u8; SensorReading::SIZE]> {
        self.0.borrow().clone()
    }
}

impl RecordSink for FakeSink {
    async fn publish(&self, frame: &[u8; SensorReading::SIZE]) {
        self.0.borrow_mut().push(*frame);
    }
}

// ---------------------------------------------------------------------------
// Sensor bus
// ---------------------------------------------------------------------------

#[derive(Default, Clone, Copy)]
struct FakeDevice {
    pointer: u8,
    config: u8,
    temperature: [u8; 2],
}

#[derive(Default)]
struct BusInner {
    devices: BTreeMap<u8, FakeDevice>,
    failing: BTreeSet<u8>,
    hold_conversions: bool,
}

/// Register-level MAX31725 array simulation.
///
/// One-shot conversions complete instantly unless `hold_conversions` is set,
/// which leaves the busy bit latched so the stale-data path can be tested.
#[derive(Clone, Default)]
pub struct FakeBus(Rc<RefCell<BusInner>>);

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_temperature(&self, channel: usize, degrees: u8, half: bool) {
        let address = SENSOR_ADDRESSES[channel] >> 1;
        let mut inner = self.0.borrow_mut();
        let device = inner.devices.entry(address).or_default();
        device.temperature = [degrees, if half { 0x80 } else { 0x00 }];
    }

    pub fn fail_channel(&self, channel: usize) {
        let address = SENSOR_ADDRESSES[channel] >> 1;
        self.0.borrow_mut().failing.insert(address);
    }

    pub fn hold_conversions(&self, hold: bool) {
        self.0.borrow_mut().hold_conversions = hold;
    }
}

impl ErrorType for FakeBus {
    type Error = ErrorKind;
}

impl I2c for FakeBus {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut inner = self.0.borrow_mut();

        if inner.failing.contains(&address) {
            return Err(ErrorKind::Other);
        }

        let hold = inner.hold_conversions;
        let device = inner.devices.entry(address).or_default();

        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    if let Some(&register) = bytes.first() {
                        device.pointer = register;
                    }
                    if bytes.len() == 2 && device.pointer == REG_CONFIGURATION {
                        device.config = bytes[1];
                        if !hold {
                            // Conversion finishes immediately.
                            device.config &= !CONFIG_ONE_SHOT;
                        }
                    }
                }
                Operation::Read(buf) => {
                    let source = match device.pointer {
                        REG_TEMPERATURE => device.temperature,
                        _ => [device.config, device.config],
                    };
                    for (i, byte) in buf.iter_mut().enumerate() {
                        *byte = source[i.min(1)];
                    }
                }
            }
        }

        Ok(())
    }
}
