//! Desktop simulator for the sole-rs acquisition/playback engine.
//!
//! Runs the full engine against simulated hardware: a register-level
//! MAX31725 array generating synthetic foot temperatures, an in-memory
//! flash region and key-value store, and a console notification sink.
//! Commands are typed on stdin exactly as the remote peer would send them.
//!
//! # Commands
//!
//! | Input            | Action                                      |
//! |------------------|---------------------------------------------|
//! | `r [epoch]`      | start acquisition (`R` frame)               |
//! | `s [epoch]`      | stop acquisition (`S` frame)                |
//! | `p [epoch]`      | start playback (`P` frame)                  |
//! | `h [epoch]`      | halt playback (`H` frame)                   |
//! | `c [epoch]`      | clear stored data (`C` frame)               |
//! | `sub`            | simulate a peer subscribing                 |
//! | `q`              | quit                                        |
//!
//! Omitted timestamps default to the host's current epoch second. Intervals
//! are shortened from the production 60 s / 2 s cadence so the simulator is
//! watchable.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::i2c::{ErrorKind, ErrorType, I2c, Operation};
use log::{info, warn};
use static_cell::StaticCell;

use sole_core::clock::Clock;
use sole_core::config::EngineConfig;
use sole_core::engine::{Dispatcher, EngineState, ModeControl, Runner, SharedState};
use sole_core::sensors::max31725::{CONFIG_ONE_SHOT, REG_CONFIGURATION, REG_TEMPERATURE};
use sole_core::sensors::{SENSOR_ADDRESSES, SensorArray};
use sole_core::storage::{
    FLAG_COUNT, FLAG_LIVE, FLAG_REPLAYED, MetaStore, RawStorage, RecordLog, SensorReading,
    StorageError,
};
use sole_core::transport::{CommandFrame, CommandSource, LinkEvent, RecordSink};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Size of the simulated flash log region (roughly 13k records).
const LOG_REGION_SIZE: usize = 512 * 1024;

/// Shortened engine cadence for interactive use.
const SIM_CONFIG: EngineConfig = EngineConfig {
    sample_interval: embassy_time::Duration::from_secs(5),
    playback_interval: embassy_time::Duration::from_secs(1),
    conversion_settle: embassy_time::Duration::from_millis(50),
};

// ---------------------------------------------------------------------------
// Simulated sensor bus
// ---------------------------------------------------------------------------

#[derive(Default, Clone, Copy)]
struct SimDevice {
    pointer: u8,
    config: u8,
}

/// Register-level simulation of the MAX31725 array.
///
/// Temperatures follow slow per-channel sinusoids around body heat so
/// successive records visibly differ. One-shot conversions complete
/// instantly.
#[derive(Clone, Default)]
struct SimBus {
    devices: Arc<StdMutex<HashMap<u8, SimDevice>>>,
}

impl SimBus {
    fn new() -> Self {
        Self::default()
    }

    /// Synthesizes the two temperature register bytes for one channel.
    fn temperature_registers(channel: usize) -> (u8, u8) {
        let t = epoch_now() as f64;
        let phase = channel as f64 * 0.4;

        // 25–33 °C with slow drift, different phase per channel
        let celsius = 29.0 + 3.5 * (t / 90.0 + phase).sin() + 0.5 * (t / 13.0 + phase).cos();

        let half_degrees = (celsius * 2.0).round().clamp(0.0, 255.0) as u16;
        let integer = (half_degrees >> 1) as u8;
        let fraction = if half_degrees & 1 == 1 { 0x80 } else { 0x00 };

        (integer, fraction)
    }
}

impl ErrorType for SimBus {
    type Error = ErrorKind;
}

impl I2c for SimBus {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let channel = SENSOR_ADDRESSES
            .iter()
            .position(|a| *a >> 1 == address)
            .ok_or(ErrorKind::Other)?;

        let mut devices = self.devices.lock().expect("bus state poisoned");
        let device = devices.entry(address).or_default();

        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    if let Some(&register) = bytes.first() {
                        device.pointer = register;
                    }
                    if bytes.len() == 2 && device.pointer == REG_CONFIGURATION {
                        // Conversion completes before anyone can poll it.
                        device.config = bytes[1] & !CONFIG_ONE_SHOT;
                    }
                }
                Operation::Read(buf) => {
                    let source = match device.pointer {
                        REG_TEMPERATURE => {
                            let (integer, fraction) = Self::temperature_registers(channel);
                            [integer, fraction]
                        }
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

// ---------------------------------------------------------------------------
// Simulated storage
// ---------------------------------------------------------------------------

/// In-memory flash region standing in for the log partition.
#[derive(Clone)]
struct SimFlash {
    data: Arc<StdMutex<Vec<u8>>>,
}

impl SimFlash {
    fn new() -> Self {
        Self {
            data: Arc::new(StdMutex::new(vec![0xFF; LOG_REGION_SIZE])),
        }
    }
}

impl RawStorage for SimFlash {
    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.lock().expect("flash state poisoned");
        let offset = offset as usize;

        if offset + bytes.len() > data.len() {
            return Err(StorageError::WriteFailed);
        }

        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let data = self.data.lock().expect("flash state poisoned");
        let offset = offset as usize;

        if offset + buf.len() > data.len() {
            return Err(StorageError::ReadFailed);
        }

        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    async fn erase(&mut self) -> Result<(), StorageError> {
        self.data.lock().expect("flash state poisoned").fill(0xFF);
        Ok(())
    }
}

/// In-memory key-value store standing in for NVS.
#[derive(Clone, Default)]
struct SimNvs {
    map: Arc<StdMutex<HashMap<String, u32>>>,
}

impl SimNvs {
    fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for SimNvs {
    async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        Ok(self.map.lock().expect("nvs state poisoned").get(key).copied())
    }

    async fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.map
            .lock()
            .expect("nvs state poisoned")
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn erase_key(&mut self, key: &str) -> Result<(), StorageError> {
        self.map.lock().expect("nvs state poisoned").remove(key);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock, sink and command source
// ---------------------------------------------------------------------------

fn epoch_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Host clock with a peer-settable offset.
struct SimClock {
    offset: AtomicI64,
}

impl SimClock {
    const fn new() -> Self {
        Self {
            offset: AtomicI64::new(0),
        }
    }
}

impl Clock for SimClock {
    fn now(&self) -> u32 {
        (epoch_now() as i64 + self.offset.load(Ordering::Relaxed)) as u32
    }

    fn set(&self, epoch: u32) {
        let offset = epoch as i64 - epoch_now() as i64;
        self.offset.store(offset, Ordering::Relaxed);
        info!("clock set to {} (offset {} s)", epoch, offset);
    }
}

/// Prints every notification the peer would receive.
struct ConsoleSink;

impl RecordSink for ConsoleSink {
    async fn publish(&self, frame: &[u8; SensorReading::SIZE]) {
        let Ok(reading) = SensorReading::decode(frame) else {
            return;
        };

        match reading.flag {
            FLAG_LIVE | FLAG_REPLAYED => {
                let kind = if reading.flag == FLAG_LIVE {
                    "live"
                } else {
                    "replayed"
                };
                info!(
                    "notify: {} record #{} time={} temps {:.1} {:.1} {:.1} ... {:.1} °C",
                    kind,
                    reading.sequence,
                    reading.timestamp,
                    f32::from(reading.values[0]) / 2.0,
                    f32::from(reading.values[1]) / 2.0,
                    f32::from(reading.values[2]) / 2.0,
                    f32::from(reading.values[30]) / 2.0,
                );
            }
            FLAG_COUNT => info!("notify: {} records stored", reading.sequence),
            other => warn!("notify: record with unexpected flag {}", other),
        }
    }
}

/// Events typed on stdin, bridged from a blocking reader thread.
static EVENTS: Channel<CriticalSectionRawMutex, LinkEvent, 8> = Channel::new();

struct ConsoleLink;

impl CommandSource for ConsoleLink {
    async fn next_event(&mut self) -> LinkEvent {
        EVENTS.receive().await
    }
}

/// Turns one input line into the frame the peer would have written.
fn parse_line(line: &str) -> Option<LinkEvent> {
    let mut parts = line.split_whitespace();
    let word = parts.next()?;

    if word.eq_ignore_ascii_case("sub") || word.eq_ignore_ascii_case("subscribe") {
        return Some(LinkEvent::SubscriberJoined);
    }

    let tag = word.bytes().next()?.to_ascii_uppercase();
    let timestamp = match parts.next() {
        Some(explicit) => explicit.to_owned(),
        None => epoch_now().to_string(),
    };

    let mut frame = CommandFrame::new();
    frame.push(tag).ok()?;
    frame.extend_from_slice(timestamp.as_bytes()).ok()?;

    Some(LinkEvent::Command(frame))
}

fn spawn_stdin_reader() {
    std::thread::spawn(|| {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };

            if line.trim().eq_ignore_ascii_case("q") || line.trim().eq_ignore_ascii_case("quit") {
                std::process::exit(0);
            }

            if let Some(event) = parse_line(&line) {
                if EVENTS.try_send(event).is_err() {
                    warn!("command dropped, engine is busy");
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[embassy_executor::task]
async fn engine_task(
    mut runner: Runner<'static, SimBus, SimFlash, SimNvs, ConsoleSink, SimClock>,
) {
    runner.run().await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting sole-rs simulator");
    info!("Commands: r=start  s=stop  p=play  h=halt  c=clear  sub=subscribe  q=quit");

    static STATE: StaticCell<SharedState<SimFlash, SimNvs>> = StaticCell::new();
    static CONTROL: ModeControl = ModeControl::new();
    static CLOCK: SimClock = SimClock::new();
    static SINK: ConsoleSink = ConsoleSink;

    let log = RecordLog::open(SimFlash::new(), SimNvs::new())
        .await
        .expect("opening the record log cannot fail in memory");
    info!("{} records stored", log.record_count());

    let state: &'static SharedState<SimFlash, SimNvs> =
        STATE.init(Mutex::new(EngineState::new(log)));

    let runner = Runner::new(
        SensorArray::new(SimBus::new()),
        state,
        &CONTROL,
        &SINK,
        &CLOCK,
        SIM_CONFIG,
    );
    spawner.spawn(engine_task(runner)).expect("spawn engine task");

    spawn_stdin_reader();

    let dispatcher = Dispatcher::new(state, &CONTROL, &SINK, &CLOCK);
    let mut link = ConsoleLink;
    dispatcher.serve(&mut link).await
}
