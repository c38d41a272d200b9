//! A clock seam so the Scheduler, Worker Pool and Stalled-Job Detector can be
//! driven by a controllable clock in tests instead of real sleeps (see
//! `jobforge-testing`'s `ManualClock`).

use chrono::Utc;

/// Current time as milliseconds since the Unix epoch, the unit every
/// timestamp field in the job record schema (`available_at_ms`, `lease_until_ms`, ...) uses.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

/// The production clock: wall-clock time via `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
