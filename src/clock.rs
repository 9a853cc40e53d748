//! Injected time source
//!
//! Every "now" read in the engine goes through a [`Clock`] so that sample-age
//! windows, cardinality windows, and archival cutoffs are deterministic in
//! tests. Production wiring uses [`SystemClock`]; tests use [`ManualClock`].

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Source of the current time, epoch milliseconds
pub trait Clock: Send + Sync {
    /// Current time in epoch millis
    fn now_ms(&self) -> i64;

    /// Current time as a UTC datetime
    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now_ms: Mutex<i64>,
}

impl ManualClock {
    /// Create a clock pinned at the given epoch millis
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Mutex::new(now_ms),
        }
    }

    /// Pin the clock to an absolute time
    pub fn set(&self, now_ms: i64) {
        *self.now_ms.lock() = now_ms;
    }

    /// Move the clock forward (or backward with a negative delta)
    pub fn advance_ms(&self, delta_ms: i64) {
        *self.now_ms.lock() += delta_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.now_ms.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_700_000_000_000);
        assert_eq!(clock.now_ms(), 1_700_000_000_000);

        clock.advance_ms(5_000);
        assert_eq!(clock.now_ms(), 1_700_000_005_000);

        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_now_utc_roundtrip() {
        let clock = ManualClock::new(1_700_000_000_000);
        assert_eq!(clock.now_utc().timestamp_millis(), 1_700_000_000_000);
    }
}
