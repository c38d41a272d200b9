//! A controllable clock for deterministic Scheduler/Worker Pool/Stalled-Job
//! Detector tests (paired with [`crate::InMemoryKv`]).

use std::sync::atomic::{AtomicI64, Ordering};

use jobforge::Clock;

/// A clock that only moves when told to. Starts at an arbitrary but fixed
/// epoch so tests don't depend on wall-clock time at all.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Moves the clock forward by `delta_ms` and returns the new time.
    pub fn advance(&self, delta_ms: i64) -> i64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }

    pub fn set(&self, at_ms: i64) {
        self.now_ms.store(at_ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z, just so timestamps in failed assertions read
        // as plausible dates instead of small integers near zero.
        ManualClock::new(1_704_067_200_000)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
