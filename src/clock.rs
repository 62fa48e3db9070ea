//! Clock abstraction.
//!
//! A thin seam between time-dependent code (the job system's
//! diagnostics, a hosting game loop's frame pacing) and either real
//! wall-clock time or a deterministic fake used in tests.

use std::time::{Duration, Instant};

/// Abstraction over wall-clock time and sleeping.
///
/// Implemented by [`SystemClock`] for production use and [`FakeClock`]
/// for tests that need deterministic, fast-forwarding time.
pub trait Clock: Send + Sync {
    /// Returns the current time as tracked by this clock.
    fn now(&self) -> Instant;

    /// Blocks (or, for a fake clock, simply advances time) for `duration`.
    fn sleep_for(&self, duration: Duration);
}

/// Real-time [`Clock`] backed by [`std::time::Instant`] and
/// [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_for(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic [`Clock`] for tests.
///
/// Starts at the epoch (`Instant::now()` captured at construction,
/// offset to zero). [`FakeClock::now`] does not advance time unless
/// [`FakeClock::set_auto_advance`] has configured an auto-advance
/// step; [`FakeClock::sleep_for`] always advances by the requested
/// duration plus any configured sleep offset, independent of
/// auto-advance.
pub struct FakeClock {
    base: Instant,
    offset: std::sync::Mutex<FakeClockState>,
}

struct FakeClockState {
    elapsed: Duration,
    auto_advance: Duration,
    sleep_offset: Duration,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Creates a fake clock starting at its own epoch (elapsed = 0).
    pub fn new() -> Self {
        FakeClock {
            base: Instant::now(),
            offset: std::sync::Mutex::new(FakeClockState {
                elapsed: Duration::ZERO,
                auto_advance: Duration::ZERO,
                sleep_offset: Duration::ZERO,
            }),
        }
    }

    /// Returns the current fake time without advancing it.
    pub fn get_time(&self) -> Instant {
        self.base + self.offset.lock().unwrap().elapsed
    }

    /// Sets the current fake time (relative to this clock's epoch).
    pub fn set_time(&self, elapsed_since_epoch: Duration) {
        self.offset.lock().unwrap().elapsed = elapsed_since_epoch;
    }

    /// Advances the fake time by `duration`.
    pub fn advance_time(&self, duration: Duration) {
        self.offset.lock().unwrap().elapsed += duration;
    }

    /// Every call to [`Clock::now`] advances time by this amount before
    /// returning it. Zero (the default) means `now()` never advances
    /// time on its own.
    pub fn set_auto_advance(&self, auto_advance: Duration) {
        self.offset.lock().unwrap().auto_advance = auto_advance;
    }

    /// Extra time added on top of the requested duration whenever
    /// [`Clock::sleep_for`] is called. Does not affect [`Clock::now`].
    pub fn set_sleep_offset(&self, sleep_offset: Duration) {
        self.offset.lock().unwrap().sleep_offset = sleep_offset;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let mut state = self.offset.lock().unwrap();
        let auto_advance = state.auto_advance;
        state.elapsed += auto_advance;
        self.base + state.elapsed
    }

    fn sleep_for(&self, duration: Duration) {
        let mut state = self.offset.lock().unwrap();
        let sleep_offset = state.sleep_offset;
        state.elapsed += duration + sleep_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_epoch() {
        let clock = FakeClock::new();
        assert_eq!(clock.get_time(), clock.base);
    }

    #[test]
    fn set_time_is_observed_by_get_time() {
        let clock = FakeClock::new();
        clock.set_time(Duration::from_secs(100));
        assert_eq!(clock.get_time(), clock.base + Duration::from_secs(100));
    }

    #[test]
    fn advance_time_accumulates() {
        let clock = FakeClock::new();
        clock.set_time(Duration::from_secs(10));
        clock.advance_time(Duration::from_secs(3600));
        assert_eq!(clock.get_time(), clock.base + Duration::from_secs(3610));
    }

    #[test]
    fn now_does_not_auto_advance_by_default() {
        let clock = FakeClock::new();
        clock.set_time(Duration::from_secs(5));
        let t1 = clock.now();
        let t2 = clock.now();
        assert_eq!(t1, t2);
    }

    #[test]
    fn now_auto_advances_when_configured() {
        let clock = FakeClock::new();
        clock.set_auto_advance(Duration::from_secs(60));
        let t0 = clock.get_time();
        let t1 = clock.now();
        let t2 = clock.now();
        assert_eq!(t1, t0 + Duration::from_secs(60));
        assert_eq!(t2, t0 + Duration::from_secs(120));
    }

    #[test]
    fn sleep_for_advances_by_duration_plus_offset() {
        let clock = FakeClock::new();
        clock.set_sleep_offset(Duration::from_millis(1));
        let before = clock.get_time();
        clock.sleep_for(Duration::from_secs(1));
        assert_eq!(clock.get_time(), before + Duration::from_millis(1001));
    }

    #[test]
    fn sleep_offset_does_not_affect_now() {
        let clock = FakeClock::new();
        clock.set_sleep_offset(Duration::from_millis(1));
        let t1 = clock.now();
        let t2 = clock.now();
        assert_eq!(t1, t2);
    }

    #[test]
    fn auto_advance_does_not_affect_sleep_for() {
        let clock = FakeClock::new();
        clock.set_auto_advance(Duration::from_millis(1));
        let before = clock.get_time();
        clock.sleep_for(Duration::from_secs(1));
        assert_eq!(clock.get_time(), before + Duration::from_secs(1));
    }
}
