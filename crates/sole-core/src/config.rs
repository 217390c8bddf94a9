//! Engine timing configuration.

use embassy_time::Duration;

/// Intervals driving the acquisition and playback loops.
///
/// `Default` is the production cadence; the simulator and tests substitute
/// shorter intervals.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Time between acquisition cycles.
    pub sample_interval: Duration,
    /// Time between replayed records.
    pub playback_interval: Duration,
    /// Settle delay between triggering one-shot conversions and reading
    /// them back.
    pub conversion_settle: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(60),
            playback_interval: Duration::from_secs(2),
            conversion_settle: Duration::from_millis(50),
        }
    }
}
