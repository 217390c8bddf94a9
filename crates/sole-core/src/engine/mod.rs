//! Command-driven engine: mode state machine, dispatcher and runner task.
//!
//! All mutable engine state sits in one [`EngineState`] behind a single
//! async mutex; the [`Dispatcher`] is the only place commands are handled,
//! one frame to completion at a time. A single [`Runner`] task executes
//! either acquisition or playback, so the two can never be active at once.

mod acquisition;
mod playback;

use core::cell::Cell;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::sensors::SensorArray;
use crate::storage::{MetaStore, RawStorage, RecordLog, SensorReading, StorageError};
use crate::transport::{CommandSource, LinkEvent, RecordSink};

/// What the engine is currently doing. Modes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Acquiring,
    Playing,
}

/// Shared mode cell plus a wakeup signal.
///
/// The dispatcher requests modes; the runner observes requests at its loop
/// boundaries and writes back self-transitions (playback running off the end
/// of the log).
pub struct ModeControl {
    mode: BlockingMutex<CriticalSectionRawMutex, Cell<Mode>>,
    changed: Signal<CriticalSectionRawMutex, ()>,
}

impl ModeControl {
    pub const fn new() -> Self {
        Self {
            mode: BlockingMutex::new(Cell::new(Mode::Idle)),
            changed: Signal::new(),
        }
    }

    /// Currently requested/active mode.
    pub fn mode(&self) -> Mode {
        self.mode.lock(|m| m.get())
    }

    /// Requests a mode change and wakes the runner.
    pub fn request(&self, mode: Mode) {
        self.mode.lock(|m| m.set(mode));
        self.changed.signal(());
    }

    /// Runner-side transition that must not re-wake the runner.
    fn settle(&self, mode: Mode) {
        self.mode.lock(|m| m.set(mode));
    }

    async fn changed(&self) {
        self.changed.wait().await
    }
}

impl Default for ModeControl {
    fn default() -> Self {
        Self::new()
    }
}

/// All mutable engine state, owned in one place.
pub struct EngineState<F, K> {
    pub(crate) log: RecordLog<F, K>,
    /// In-memory acquisition sequence counter, seeded from the stored record
    /// count so numbering continues across reboots.
    pub(crate) sequence: u32,
    /// 1-based playback position; 0 means inactive. Survives an external
    /// halt as the resume position.
    pub(crate) play_cursor: u32,
}

impl<F, K> EngineState<F, K>
where
    F: RawStorage,
    K: MetaStore,
{
    pub fn new(log: RecordLog<F, K>) -> Self {
        let sequence = log.record_count();
        Self {
            log,
            sequence,
            play_cursor: 0,
        }
    }

    /// Number of records currently stored.
    pub fn record_count(&self) -> u32 {
        self.log.record_count()
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        self.log.clear().await?;
        self.sequence = 0;
        self.play_cursor = 0;
        Ok(())
    }
}

/// The engine state behind its single serialization point.
pub type SharedState<F, K> = Mutex<CriticalSectionRawMutex, EngineState<F, K>>;

/// Decodes inbound command frames and drives the state machine.
pub struct Dispatcher<'a, F, K, S, C> {
    state: &'a SharedState<F, K>,
    control: &'a ModeControl,
    sink: &'a S,
    clock: &'a C,
}

impl<'a, F, K, S, C> Dispatcher<'a, F, K, S, C>
where
    F: RawStorage,
    K: MetaStore,
    S: RecordSink,
    C: Clock,
{
    pub fn new(
        state: &'a SharedState<F, K>,
        control: &'a ModeControl,
        sink: &'a S,
        clock: &'a C,
    ) -> Self {
        Self {
            state,
            control,
            sink,
            clock,
        }
    }

    /// Consumes transport events forever.
    ///
    /// Each frame is handled to completion before the next is polled, which
    /// is what keeps start/stop sequencing race-free.
    pub async fn serve<Src: CommandSource>(&self, source: &mut Src) -> ! {
        loop {
            match source.next_event().await {
                LinkEvent::Command(frame) => self.handle_frame(&frame).await,
                LinkEvent::SubscriberJoined => self.announce_count().await,
            }
        }
    }

    /// Handles one command frame: clock sync first, then the tag.
    pub async fn handle_frame(&self, frame: &[u8]) {
        let Some((&tag, timestamp)) = frame.split_first() else {
            return;
        };

        match parse_timestamp(timestamp) {
            Some(epoch) => self.clock.set(epoch),
            None => warn!("command carried no usable timestamp, clock unchanged"),
        }

        match tag {
            b'R' => {
                debug!("received START command");
                self.control.request(Mode::Acquiring);
            }
            b'S' => {
                debug!("received STOP command");
                self.control.request(Mode::Idle);
            }
            b'P' => {
                debug!("received PLAY command");
                self.control.request(Mode::Playing);
            }
            b'H' => {
                debug!("received HALT command");
                self.control.request(Mode::Idle);
            }
            b'C' => {
                debug!("received CLEAR command");
                let mut state = self.state.lock().await;
                if let Err(e) = state.clear().await {
                    warn!("clearing stored records failed: {}", e);
                }
            }
            other => debug!("command {:#04x} not recognized", other),
        }
    }

    /// Tells a freshly subscribed peer how many records are stored.
    pub async fn announce_count(&self) {
        let count = self.state.lock().await.record_count();
        info!("announcing record count {} to subscriber", count);

        let reading = SensorReading::count_announcement(count);
        self.sink.publish(&reading.encode()).await;
    }
}

/// Parses the ASCII decimal timestamp that follows the command tag.
///
/// The transport zero-pads its receive buffer, so trailing NULs and
/// whitespace are ignored.
fn parse_timestamp(raw: &[u8]) -> Option<u32> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = core::str::from_utf8(&raw[..end]).ok()?;
    text.trim().parse().ok()
}

/// The single background task: runs acquisition or playback depending on
/// the requested mode, observing mode changes only at loop boundaries.
pub struct Runner<'a, B, F, K, S, C> {
    sensors: SensorArray<B>,
    state: &'a SharedState<F, K>,
    control: &'a ModeControl,
    sink: &'a S,
    clock: &'a C,
    config: EngineConfig,
}

impl<'a, B, F, K, S, C> Runner<'a, B, F, K, S, C>
where
    B: embedded_hal_async::i2c::I2c,
    F: RawStorage,
    K: MetaStore,
    S: RecordSink,
    C: Clock,
{
    pub fn new(
        sensors: SensorArray<B>,
        state: &'a SharedState<F, K>,
        control: &'a ModeControl,
        sink: &'a S,
        clock: &'a C,
        config: EngineConfig,
    ) -> Self {
        Self {
            sensors,
            state,
            control,
            sink,
            clock,
            config,
        }
    }

    pub async fn run(&mut self) -> ! {
        self.sensors.init_all().await;

        loop {
            match self.control.mode() {
                Mode::Idle => self.control.changed().await,
                Mode::Acquiring => {
                    self.acquire_cycle().await;
                    self.pause(self.config.sample_interval, Mode::Acquiring)
                        .await;
                }
                Mode::Playing => {
                    if self.play_step().await {
                        self.pause(self.config.playback_interval, Mode::Playing)
                            .await;
                    } else {
                        debug!("finished playing data");
                        self.control.settle(Mode::Idle);
                    }
                }
            }
        }
    }

    /// Sleeps up to `interval`, returning early when the mode moves away
    /// from `current`. A redundant request for the current mode does not
    /// reset the deadline.
    async fn pause(&self, interval: Duration, current: Mode) {
        let deadline = Instant::now() + interval;

        loop {
            match select(Timer::at(deadline), self.control.changed()).await {
                Either::First(()) => return,
                Either::Second(()) => {
                    if self.control.mode() != current {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::storage::FLAG_COUNT;
    use crate::testutil::{FakeClock, FakeFlash, FakeNvs, FakeSink, engine_state};

    fn fixture() -> (
        SharedState<FakeFlash, FakeNvs>,
        ModeControl,
        FakeSink,
        FakeClock,
    ) {
        (
            Mutex::new(block_on(engine_state(0))),
            ModeControl::new(),
            FakeSink::new(),
            FakeClock::new(0),
        )
    }

    #[test]
    fn timestamp_parsing() {
        assert_eq!(parse_timestamp(b"1700000000"), Some(1_700_000_000));
        assert_eq!(parse_timestamp(b"1700000000\0\0\0"), Some(1_700_000_000));
        assert_eq!(parse_timestamp(b" 42 "), Some(42));
        assert_eq!(parse_timestamp(b""), None);
        assert_eq!(parse_timestamp(b"abc"), None);
        assert_eq!(parse_timestamp(b"99999999999999"), None);
    }

    #[test]
    fn play_command_sets_clock_and_mode() {
        let (state, control, sink, clock) = fixture();
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        block_on(dispatcher.handle_frame(b"P1700000000"));

        assert_eq!(control.mode(), Mode::Playing);
        assert_eq!(clock.now(), 1_700_000_000);
    }

    #[test]
    fn start_while_playing_switches_to_acquisition() {
        let (state, control, sink, clock) = fixture();
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);
        control.request(Mode::Playing);

        block_on(dispatcher.handle_frame(b"R1700000001"));

        assert_eq!(control.mode(), Mode::Acquiring);
    }

    #[test]
    fn play_while_acquiring_switches_to_playback() {
        let (state, control, sink, clock) = fixture();
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);
        control.request(Mode::Acquiring);

        block_on(dispatcher.handle_frame(b"P1700000001"));

        assert_eq!(control.mode(), Mode::Playing);
    }

    #[test]
    fn stop_and_halt_return_to_idle() {
        let (state, control, sink, clock) = fixture();
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        control.request(Mode::Acquiring);
        block_on(dispatcher.handle_frame(b"S1"));
        assert_eq!(control.mode(), Mode::Idle);

        control.request(Mode::Playing);
        block_on(dispatcher.handle_frame(b"H2"));
        assert_eq!(control.mode(), Mode::Idle);
    }

    #[test]
    fn unknown_tag_updates_clock_only() {
        let (state, control, sink, clock) = fixture();
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        block_on(dispatcher.handle_frame(b"X1700000002"));

        assert_eq!(control.mode(), Mode::Idle);
        assert_eq!(clock.now(), 1_700_000_002);
        assert!(sink.frames().is_empty());
    }

    #[test]
    fn malformed_timestamp_leaves_clock_unchanged() {
        let (state, control, sink, clock) = fixture();
        clock.set(77);
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        block_on(dispatcher.handle_frame(b"Pnot-a-number"));

        assert_eq!(clock.now(), 77);
        assert_eq!(control.mode(), Mode::Playing);
    }

    #[test]
    fn empty_frame_is_a_no_op() {
        let (state, control, sink, clock) = fixture();
        clock.set(77);
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        block_on(dispatcher.handle_frame(b""));

        assert_eq!(clock.now(), 77);
        assert_eq!(control.mode(), Mode::Idle);
    }

    #[test]
    fn clear_command_resets_counters_and_cursor() {
        let (state, control, sink, clock) = fixture();
        {
            let mut guard = block_on(state.lock());
            *guard = block_on(engine_state(3));
            guard.play_cursor = 2;
        }
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        block_on(dispatcher.handle_frame(b"C1700000003"));

        let guard = block_on(state.lock());
        assert_eq!(guard.record_count(), 0);
        assert_eq!(guard.sequence, 0);
        assert_eq!(guard.play_cursor, 0);
        assert_eq!(control.mode(), Mode::Idle);
    }

    #[test]
    fn subscriber_gets_count_announcement() {
        let (state, control, sink, clock) = fixture();
        {
            let mut guard = block_on(state.lock());
            *guard = block_on(engine_state(5));
        }
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        block_on(dispatcher.announce_count());

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);

        let announced = SensorReading::decode(&frames[0]).unwrap();
        assert_eq!(announced.flag, FLAG_COUNT);
        assert_eq!(announced.sequence, 5);
        assert_eq!(&frames[0][0..3], &[5, 0, 0]);
    }
}
