//! One acquisition cycle: trigger, settle, read, persist, publish.

use embassy_time::Timer;
use log::{debug, warn};

use crate::clock::Clock;
use crate::storage::{CHANNEL_COUNT, MetaStore, RawStorage, SensorReading};
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
    /// Samples every channel once and emits the resulting record.
    ///
    /// The cycle always completes once entered; mode changes take effect at
    /// the loop boundary afterwards. Appending is the only state-mutating
    /// step, so an abandoned task can never leave a half-written record.
    pub(crate) async fn acquire_cycle(&mut self) {
        let (sequence, timestamp) = {
            let mut state = self.state.lock().await;
            state.sequence = state.sequence.wrapping_add(1);
            (state.sequence, self.clock.now())
        };

        self.sensors.begin_conversion_all().await;
        Timer::after(self.config.conversion_settle).await;

        if self.sensors.conversion_pending().await {
            warn!("sensor conversion not finished after settle delay, readings may be stale");
        }

        let mut values = [0u8; CHANNEL_COUNT];
        self.sensors.read_all(&mut values).await;

        let reading = SensorReading::live(sequence, timestamp, values);
        debug!(
            "record #{} at {}: {:.1} {:.1} {:.1} ...",
            sequence,
            timestamp,
            f32::from(values[0]) / 2.0,
            f32::from(values[1]) / 2.0,
            f32::from(values[2]) / 2.0,
        );

        {
            let mut state = self.state.lock().await;
            if let Err(e) = state.log.append(&reading).await {
                warn!("failed to persist record #{}: {}", sequence, e);
            }
        }

        // The freshly acquired record goes out even when persisting it
        // failed; the peer sees live data either way.
        self.sink.publish(&reading.encode()).await;
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_sync::mutex::Mutex;
    use embassy_time::Duration;

    use crate::config::EngineConfig;
    use crate::engine::{EngineState, ModeControl, Runner, SharedState};
    use crate::sensors::SensorArray;
    use crate::storage::{FLAG_LIVE, RecordLog, SensorReading};
    use crate::testutil::{FakeBus, FakeClock, FakeFlash, FakeNvs, FakeSink, engine_state};

    fn test_config() -> EngineConfig {
        EngineConfig {
            conversion_settle: Duration::from_millis(1),
            ..EngineConfig::default()
        }
    }

    fn harness(
        records: u32,
    ) -> (
        SharedState<FakeFlash, FakeNvs>,
        ModeControl,
        FakeSink,
        FakeClock,
        FakeBus,
    ) {
        (
            Mutex::new(block_on(engine_state(records))),
            ModeControl::new(),
            FakeSink::new(),
            FakeClock::new(1_700_000_000),
            FakeBus::new(),
        )
    }

    #[test]
    fn cycle_appends_and_publishes_live_record() {
        let (state, control, sink, clock, bus) = harness(0);
        for channel in 0..31 {
            bus.set_temperature(channel, 25, channel % 2 == 0);
        }

        let mut runner = Runner::new(
            SensorArray::new(bus),
            &state,
            &control,
            &sink,
            &clock,
            test_config(),
        );
        block_on(runner.acquire_cycle());

        let mut guard = block_on(state.lock());
        assert_eq!(guard.record_count(), 1);

        let stored = block_on(guard.log.read_at(1)).unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(stored.flag, FLAG_LIVE);
        assert_eq!(stored.timestamp, 1_700_000_000);
        assert_eq!(stored.values[0], 51);
        assert_eq!(stored.values[1], 50);

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(SensorReading::decode(&frames[0]).unwrap(), stored);
    }

    #[test]
    fn sequence_continues_across_cycles() {
        let (state, control, sink, clock, bus) = harness(2);
        for channel in 0..31 {
            bus.set_temperature(channel, 30, false);
        }

        let mut runner = Runner::new(
            SensorArray::new(bus),
            &state,
            &control,
            &sink,
            &clock,
            test_config(),
        );
        block_on(runner.acquire_cycle());

        let guard = block_on(state.lock());
        assert_eq!(guard.sequence, 3);
        assert_eq!(guard.record_count(), 3);
    }

    #[test]
    fn failed_channel_degrades_to_zero_without_aborting() {
        let (state, control, sink, clock, bus) = harness(0);
        for channel in 0..31 {
            bus.set_temperature(channel, 20, false);
        }
        bus.fail_channel(7);

        let mut runner = Runner::new(
            SensorArray::new(bus),
            &state,
            &control,
            &sink,
            &clock,
            test_config(),
        );
        block_on(runner.acquire_cycle());

        let mut guard = block_on(state.lock());
        let stored = block_on(guard.log.read_at(1)).unwrap();
        assert_eq!(stored.values[7], 0);
        assert_eq!(stored.values[6], 40);
        assert_eq!(stored.values[8], 40);
    }

    #[test]
    fn failed_append_still_publishes() {
        let flash = FakeFlash::new(4096);
        let log = block_on(RecordLog::open(flash.clone(), FakeNvs::new())).unwrap();
        let state: SharedState<FakeFlash, FakeNvs> = Mutex::new(EngineState::new(log));
        let control = ModeControl::new();
        let sink = FakeSink::new();
        let clock = FakeClock::new(1_700_000_000);
        let bus = FakeBus::new();
        for channel in 0..31 {
            bus.set_temperature(channel, 20, false);
        }
        flash.fail_writes(true);

        let mut runner = Runner::new(
            SensorArray::new(bus),
            &state,
            &control,
            &sink,
            &clock,
            test_config(),
        );
        block_on(runner.acquire_cycle());

        let guard = block_on(state.lock());
        assert_eq!(guard.record_count(), 0);
        assert_eq!(sink.frames().len(), 1);
    }
}
