//! Monotonic and wall-clock time sources.
//!
//! All internal latency measurement uses monotonic nanosecond ticks, immune
//! to NTP steps and wall-clock adjustments. Wall-clock time is used only for
//! correlation with external systems (trace start/capture times shown to
//! users). The two domains never mix.

use std::sync::Arc;

/// Monotonic nanosecond ticker.
///
/// Ticks count from a per-ticker epoch captured at construction, so values
/// are only comparable within one ticker. Cloning shares the epoch.
#[derive(Debug, Clone)]
pub struct Ticker {
    clock: quanta::Clock,
    epoch: quanta::Instant,
}

impl Ticker {
    /// Ticker backed by the system's high-resolution monotonic clock
    /// (TSC-based where available).
    pub fn system() -> Self {
        let clock = quanta::Clock::new();
        let epoch = clock.now();
        Self { clock, epoch }
    }

    /// Ticker driven by a mock clock for deterministic tests; advance it
    /// with [`quanta::Mock::increment`].
    pub fn mock() -> (Self, Arc<quanta::Mock>) {
        let (clock, mock) = quanta::Clock::mock();
        let epoch = clock.now();
        (Self { clock, epoch }, mock)
    }

    /// Nanoseconds since this ticker's epoch.
    #[inline]
    pub fn read_nanos(&self) -> u64 {
        (self.clock.now() - self.epoch).as_nanos() as u64
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::system()
    }
}

/// Millisecond wall-clock source, injectable for test determinism.
pub trait WallClock: Send + Sync {
    fn current_time_millis(&self) -> i64;
}

/// Wall clock reading UTC system time.
#[derive(Debug, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn current_time_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
