//! Sequential replay of stored records.

use log::{debug, warn};

use crate::clock::Clock;
use crate::storage::{FLAG_REPLAYED, MetaStore, RawStorage};
use crate::transport::RecordSink;

use super::Runner;

impl<B, F, K, S, C> Runner<'_, B, F, K, S, C>
where
    B: embedded_hal_async::i2c::I2c,
    F: RawStorage,
    K: MetaStore,
    S: RecordSink,
    C: Clock,
{
    /// Publishes the record at the playback cursor and advances it.
    ///
    /// Returns `false` when playback is over: nothing stored, the cursor ran
    /// off the end, or a read failed. All of those reset the cursor; an
    /// external halt does not go through here and keeps the cursor as the
    /// resume position.
    pub(crate) async fn play_step(&mut self) -> bool {
        let mut state = self.state.lock().await;

        let count = state.record_count();
        if state.play_cursor > count || count == 0 {
            state.play_cursor = 0;
            return false;
        }
        if state.play_cursor == 0 {
            debug!("starting playback of {} stored records", count);
            state.play_cursor = 1;
        }

        let cursor = state.play_cursor;
        let mut reading = match state.log.read_at(cursor).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("replaying record {} failed: {}", cursor, e);
                state.play_cursor = 0;
                return false;
            }
        };

        // Replayed records carry their log position, not the original
        // acquisition sequence.
        reading.sequence = cursor;
        reading.flag = FLAG_REPLAYED;

        state.play_cursor = cursor + 1;
        drop(state);

        self.sink.publish(&reading.encode()).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_sync::mutex::Mutex;

    use crate::config::EngineConfig;
    use crate::engine::{Dispatcher, Mode, ModeControl, Runner, SharedState};
    use crate::sensors::SensorArray;
    use crate::storage::{FLAG_REPLAYED, SensorReading};
    use crate::testutil::{FakeBus, FakeClock, FakeFlash, FakeNvs, FakeSink, engine_state};

    fn harness(
        records: u32,
    ) -> (
        SharedState<FakeFlash, FakeNvs>,
        ModeControl,
        FakeSink,
        FakeClock,
    ) {
        (
            Mutex::new(block_on(engine_state(records))),
            ModeControl::new(),
            FakeSink::new(),
            FakeClock::new(0),
        )
    }

    fn runner<'a>(
        state: &'a SharedState<FakeFlash, FakeNvs>,
        control: &'a ModeControl,
        sink: &'a FakeSink,
        clock: &'a FakeClock,
    ) -> Runner<'a, FakeBus, FakeFlash, FakeNvs, FakeSink, FakeClock> {
        Runner::new(
            SensorArray::new(FakeBus::new()),
            state,
            control,
            sink,
            clock,
            EngineConfig::default(),
        )
    }

    #[test]
    fn empty_log_ends_immediately_without_publishing() {
        let (state, control, sink, clock) = harness(0);
        let mut runner = runner(&state, &control, &sink, &clock);

        assert!(!block_on(runner.play_step()));
        assert!(sink.frames().is_empty());
        assert_eq!(block_on(state.lock()).play_cursor, 0);
    }

    #[test]
    fn replays_records_in_order_then_resets_cursor() {
        let (state, control, sink, clock) = harness(3);
        let mut runner = runner(&state, &control, &sink, &clock);

        for _ in 0..3 {
            assert!(block_on(runner.play_step()));
        }
        assert!(!block_on(runner.play_step()));

        let frames = sink.frames();
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            let replayed = SensorReading::decode(frame).unwrap();
            assert_eq!(replayed.sequence, i as u32 + 1);
            assert_eq!(replayed.flag, FLAG_REPLAYED);
        }

        assert_eq!(block_on(state.lock()).play_cursor, 0);
    }

    #[test]
    fn replay_overwrites_original_sequence_with_cursor() {
        // Records whose acquisition sequence does not match their log
        // position (the log survived a clear-less reboot, sequence 41..).
        let (state, control, sink, clock) = harness(0);
        {
            let mut guard = block_on(state.lock());
            for sequence in 41..=42u32 {
                block_on(
                    guard
                        .log
                        .append(&SensorReading::live(sequence, 1_000 + sequence, [9; 31])),
                )
                .unwrap();
            }
        }
        let mut runner = runner(&state, &control, &sink, &clock);

        assert!(block_on(runner.play_step()));

        let replayed = SensorReading::decode(&sink.frames()[0]).unwrap();
        assert_eq!(replayed.sequence, 1);
        assert_eq!(replayed.timestamp, 1_041);
    }

    #[test]
    fn halt_preserves_cursor_for_resume() {
        let (state, control, sink, clock) = harness(3);
        let mut runner = runner(&state, &control, &sink, &clock);

        assert!(block_on(runner.play_step()));
        // External halt: the runner just stops stepping, no reset happens.
        assert_eq!(block_on(state.lock()).play_cursor, 2);

        assert!(block_on(runner.play_step()));
        let frames = sink.frames();
        let resumed = SensorReading::decode(&frames[1]).unwrap();
        assert_eq!(resumed.sequence, 2);
    }

    #[test]
    fn read_failure_ends_playback_cleanly() {
        let flash = FakeFlash::new(4096);
        let nvs = FakeNvs::new();
        let log = block_on(crate::storage::RecordLog::open(flash.clone(), nvs)).unwrap();
        let state: SharedState<FakeFlash, FakeNvs> =
            Mutex::new(crate::engine::EngineState::new(log));
        {
            let mut guard = block_on(state.lock());
            block_on(guard.log.append(&SensorReading::live(1, 1, [1; 31]))).unwrap();
        }
        let control = ModeControl::new();
        let sink = FakeSink::new();
        let clock = FakeClock::new(0);
        let mut runner = runner(&state, &control, &sink, &clock);

        flash.fail_reads(true);

        assert!(!block_on(runner.play_step()));
        assert!(sink.frames().is_empty());
        assert_eq!(block_on(state.lock()).play_cursor, 0);
    }

    #[test]
    fn clear_then_play_publishes_nothing() {
        let (state, control, sink, clock) = harness(3);
        let dispatcher = Dispatcher::new(&state, &control, &sink, &clock);

        assert_eq!(block_on(state.lock()).record_count(), 3);
        block_on(dispatcher.handle_frame(b"C1700000000"));
        assert_eq!(block_on(state.lock()).record_count(), 0);

        block_on(dispatcher.handle_frame(b"P1700000001"));
        assert_eq!(control.mode(), Mode::Playing);

        let mut runner = runner(&state, &control, &sink, &clock);
        assert!(!block_on(runner.play_step()));
        assert!(sink.frames().is_empty());
    }
}
