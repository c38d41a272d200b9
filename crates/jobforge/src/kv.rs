//! The `Kv` trait (C1): the thin, atomic surface the rest of the engine is
//! built on. No concrete backend lives in this crate — `jobforge-redis`
//! implements it against a real Redis-protocol store with Lua scripts;
//! `jobforge-testing` implements it in-memory for deterministic tests.
//!
//! Every method that touches more than one key documents the atomicity it
//! requires; backends MUST implement those as a single scripted transaction
//! (§5: "no other client able to observe an intermediate state").

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::KvError;
use crate::types::{JobEvent, JobRecord, QueueStats};

/// Outcome of a pop-and-lease attempt (§4.3).
#[derive(Debug, Clone)]
pub enum PopOutcome {
    /// A job was popped, leased, and moved into `active`.
    Leased(JobRecord),
    /// The queue is paused or has no waiting jobs.
    Empty,
    /// The rate limiter had no token available; retry after this many ms.
    Throttled { retry_after_ms: i64 },
}

/// Outcome of a standalone rate-limiter check (§4.5), used directly by
/// Rate Limiter tests and internally folded into `pop_and_lease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Ok,
    Throttled { retry_after_ms: i64 },
}

/// Outcome of reclaiming one stalled job (§4.6).
#[derive(Debug, Clone)]
pub enum StalledOutcome {
    /// Re-inserted into `wait` with its original priority/creation ordering.
    Requeued { job_id: u64, stall_count: u32 },
    /// `stall_count` exceeded `max_stalls`; moved straight to `failed`.
    Terminated { job_id: u64 },
}

/// Outcome of `enqueue` when a `dedup_key` is supplied (§4.2, §8 property 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    Duplicate,
}

/// A page of jobs for `Admin::inspect` (§4.8).
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub jobs: Vec<JobRecord>,
    pub total: u64,
}

/// Status filter for `Clean`/`Inspect` (§4.2, §4.8). Only terminal states are
/// meaningful retention/inspection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
}

#[async_trait]
pub trait Kv: Send + Sync + 'static {
    /// Verifies the backend is reachable (§4.9 `Initialize`/`HealthCheck`).
    async fn ping(&self) -> Result<(), KvError>;

    /// Registers `queue`'s rate-limit bucket parameters (§4.1 keys
    /// `jq:{q}:rl:tokens`/`:reset`) and terminal-state retention counts
    /// (SPEC_FULL §9: `keep_completed`/`keep_failed`) so `pop_and_lease`,
    /// `complete`, and `fail_terminal` can apply them without the caller
    /// repeating them on every call. Called once per queue during
    /// `Engine::start` (§4.9 `Initialize`). `rate_limit = None` disables rate
    /// limiting for the queue, matching §4.5: "When no rate limit is
    /// configured, the Scheduler bypasses the call entirely."
    async fn configure_queue(
        &self,
        queue: &str,
        rate_limit: Option<crate::types::RateLimit>,
        keep_completed: u64,
        keep_failed: u64,
    ) -> Result<(), KvError>;

    // ---- id allocation (C2 key `jq:{q}:id`) -----------------------------

    /// Atomically allocates the next monotonic id for `queue`. Never reused,
    /// even across crashes (§3.2 invariant 3).
    async fn next_id(&self, queue: &str) -> Result<u64, KvError>;

    // ---- enqueue ---------------------------------------------------------

    /// Inserts `job` into `wait` (if `job.available_at_ms <= now_ms`) or
    /// `delayed` otherwise, after an atomic dedup check against
    /// `job.dedup_key`. Must be a single scripted transaction: the dedup
    /// check-and-insert races are the mechanism behind `EnqueueOutcome::Duplicate`.
    async fn enqueue(&self, job: JobRecord, now_ms: i64) -> Result<EnqueueOutcome, KvError>;

    // ---- scheduler: promotion, pop, completion ---------------------------

    /// Moves every `delayed` member with score `<= now_ms` into `wait`.
    /// Each individual move MUST be atomic (§4.3) so concurrent schedulers
    /// across processes never double-promote the same job. Returns the ids moved.
    async fn promote_due(&self, queue: &str, now_ms: i64) -> Result<Vec<u64>, KvError>;

    /// The combined rate-limit-then-pop scripted transaction (§4.3 steps 1-4).
    /// `lease_ms` is the duration (`job_timeout_ms + lease_buffer`) the lease
    /// is granted for from `now_ms`. Implementations MUST roll back any
    /// consumed rate-limit token if no job was available (§4.3: "the script
    /// MUST roll back the token if no job was available").
    async fn pop_and_lease(
        &self,
        queue: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<PopOutcome, KvError>;

    /// Extends `lease_until_ms` for a job still in `active`. Returns `false`
    /// if the job is no longer active (lease lost to a stalled-job reclaim).
    async fn renew_lease(
        &self,
        queue: &str,
        job_id: u64,
        new_lease_until_ms: i64,
    ) -> Result<bool, KvError>;

    /// Marks success: removes from `active`, writes `completed`, inserts into
    /// the `completed` retention set, stores `result`, then trims the set
    /// (and its backing job records) to the queue's `keep_completed` count.
    async fn complete(
        &self,
        queue: &str,
        job_id: u64,
        result: Vec<u8>,
        now_ms: i64,
    ) -> Result<(), KvError>;

    /// Failure with retries remaining: removes from `active`, increments
    /// `attempts_made`, writes `delayed` with `available_at_ms = now_ms + delay_ms`.
    async fn fail_retry(
        &self,
        queue: &str,
        job_id: u64,
        now_ms: i64,
        delay_ms: i64,
        last_error: String,
    ) -> Result<(), KvError>;

    /// Terminal failure: removes from `active`, writes `failed`, inserts into
    /// the `failed` retention set, then trims to the queue's `keep_failed` count.
    async fn fail_terminal(
        &self,
        queue: &str,
        job_id: u64,
        now_ms: i64,
        last_error: String,
    ) -> Result<(), KvError>;

    // ---- rate limiter (C4, §4.5) ------------------------------------------

    /// The standalone token-bucket check. `pop_and_lease` folds this into its
    /// own transaction; this entry point exists for direct testing of C4 and
    /// for callers that want to probe budget without popping.
    async fn take_token(
        &self,
        queue: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<RateLimitOutcome, KvError>;

    // ---- stalled-job detector (C7, §4.6) ----------------------------------

    /// Scans `active` for leases with score `< now_ms` and atomically
    /// verify-and-moves each one (§4.6: "Multiple detectors ... race on the
    /// same job; the atomic verify-and-move ensures only one succeeds.").
    async fn reclaim_stalled(
        &self,
        queue: &str,
        now_ms: i64,
        max_stalls: u32,
    ) -> Result<Vec<StalledOutcome>, KvError>;

    // ---- admin surface (C8, §4.2, §4.8) -----------------------------------

    async fn get_job(&self, queue: &str, job_id: u64) -> Result<Option<JobRecord>, KvError>;

    /// Removes a job outright. Callers MUST have already verified the job is
    /// not a live (unexpired-lease) `active` job; backends re-verify
    /// atomically and return `Ok(false)` if the job was active with a live lease.
    async fn remove_job(&self, queue: &str, job_id: u64, now_ms: i64) -> Result<bool, KvError>;

    /// Moves a `failed` job back to `wait` with `attempts_made` reset to 0.
    /// Returns `Ok(false)` if the job was not in `failed`.
    async fn retry_job(&self, queue: &str, job_id: u64, now_ms: i64) -> Result<bool, KvError>;

    async fn pause(&self, queue: &str) -> Result<(), KvError>;
    async fn resume(&self, queue: &str) -> Result<(), KvError>;
    async fn is_paused(&self, queue: &str) -> Result<bool, KvError>;

    /// Removes `status` jobs whose `finished_at_ms` predates `older_than_ms`,
    /// in batches bounded by `batch_size` (§4.8: "MUST operate in bounded
    /// batches"). Returns the number removed in this call; callers loop until 0.
    async fn clean(
        &self,
        queue: &str,
        status: TerminalStatus,
        older_than_ms: i64,
        batch_size: u32,
    ) -> Result<u64, KvError>;

    /// O(1) cardinalities of each sorted set plus the paused flag (§4.8:
    /// "Stats MUST NOT scan").
    async fn stats(&self, queue: &str) -> Result<QueueStats, KvError>;

    /// Paginates over the sorted set for `status` in `[from, to)` index range.
    async fn inspect(
        &self,
        queue: &str,
        status: TerminalStatus,
        from: u64,
        to: u64,
    ) -> Result<Page, KvError>;

    // ---- repeatable templates (§4.2, §4.3) --------------------------------

    async fn put_repeatable(
        &self,
        template: &crate::types::RepeatableTemplate,
    ) -> Result<(), KvError>;

    async fn get_repeatable(
        &self,
        queue: &str,
        repeat_id: &str,
    ) -> Result<Option<crate::types::RepeatableTemplate>, KvError>;

    /// All repeatable templates registered on `queue`, used by the Scheduler
    /// to recover from a crash between a concrete job finishing and the next
    /// one being expanded (§4.3: "the next worker to observe a 'repeat
    /// template with no live concrete job' performs recovery").
    async fn list_repeatables(
        &self,
        queue: &str,
    ) -> Result<Vec<crate::types::RepeatableTemplate>, KvError>;

    /// Whether `repeat_id` currently has a live (delayed/waiting/active) concrete job.
    async fn has_live_concrete(&self, queue: &str, repeat_id: &str) -> Result<bool, KvError>;

    // ---- event bus cross-process channel (C9, §4.7) -----------------------

    async fn publish_event(&self, event: &JobEvent) -> Result<(), KvError>;

    /// Subscribes to the `jq:events` pub/sub channel. Best-effort: loss
    /// during partitions is tolerable (§4.7).
    fn subscribe_events(&self) -> Pin<Box<dyn Stream<Item = JobEvent> + Send>>;
}
