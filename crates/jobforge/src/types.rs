//! The data model: `Queue` configuration and the mutable `Job` record (§3).

use serde::{Deserialize, Serialize};

/// A job's position in the lifecycle state machine (§3.1).
///
/// `Paused` mirrors the queue-level pause flag in the schema for field parity
/// with the source lineage; the engine never assigns it to an individual job
/// record — pausing blocks `waiting -> active` promotion at the queue level
/// instead (see `Scheduler::pop_and_lease`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Paused => "paused",
        }
    }
}

/// Backoff strategy for retries (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Backoff configuration carried per job (and as a queue default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub base_ms: i64,
    pub max_ms: i64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            strategy: BackoffStrategy::Exponential,
            base_ms: 1_000,
            max_ms: 10 * 60 * 1_000, // 10 minutes, the spec's default cap
        }
    }
}

/// A queue's token-bucket rate limit: `max` tokens refilled every `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub window_ms: i64,
}

/// Per-queue defaults applied to jobs enqueued without an explicit override.
///
/// `keep_completed`/`keep_failed` resolve the open question in SPEC_FULL.md
/// §9 ("Resolved open questions"): they are retention **counts**, not
/// windows — the queue-wide cap on how many of the most recent terminal jobs
/// a backend keeps in the `completed`/`failed` sorted sets before trimming
/// the oldest. `Clean(status, older_than_ms)` (§4.2/§4.8) remains the
/// separate, explicit time-based purge an operator triggers by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefaults {
    pub attempts: u32,
    pub backoff: Backoff,
    pub timeout_ms: i64,
    pub retain_on_completion: bool,
    pub retain_on_failure: bool,
    pub keep_completed: u64,
    pub keep_failed: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        QueueDefaults {
            attempts: 3,
            backoff: Backoff::default(),
            timeout_ms: 300_000,
            retain_on_completion: true,
            retain_on_failure: true,
            keep_completed: 1_000,
            keep_failed: 5_000,
        }
    }
}

/// Static, runtime-immutable queue configuration (§3.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub priority: i32,
    pub concurrency: u32,
    pub rate_limit: Option<RateLimit>,
    pub defaults: QueueDefaults,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Queue {
            name: name.into(),
            priority: 0,
            concurrency: 1,
            rate_limit: None,
            defaults: QueueDefaults::default(),
        }
    }
}

/// Options a producer may pass to `Enqueue` (§4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOpts {
    pub delay_ms: Option<i64>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub priority_class: Option<i32>,
    pub timeout_ms: Option<i64>,
    pub retain_on_completion: Option<bool>,
    pub retain_on_failure: Option<bool>,
    pub dedup_key: Option<String>,
}

/// Default `priority_class` for jobs that don't specify one (§3.1).
pub const DEFAULT_PRIORITY_CLASS: i32 = 2;

/// The mutable job record (§3.1, wire layout §6).
///
/// Field names deliberately match the fixed on-disk schema from §6 so the
/// KV-backed job record store can round-trip them without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub queue: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub priority_class: i32,
    pub attempts_made: u32,
    pub attempts_max: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_ms: i64,
    pub backoff_max_ms: i64,
    pub timeout_ms: i64,
    pub state: JobState,
    pub available_at_ms: i64,
    pub lease_until_ms: Option<i64>,
    pub created_at_ms: i64,
    pub first_attempted_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub result: Option<Vec<u8>>,
    pub last_error: Option<String>,
    pub stall_count: u32,
    pub dedup_key: Option<String>,
    pub repeat_id: Option<String>,
    pub retain_on_completion: bool,
    pub retain_on_failure: bool,
}

impl JobRecord {
    /// Score used to order the `wait` sorted set: `priority_class asc, created_at asc`
    /// (§3.2 invariant 2, key schema §4.1).
    ///
    /// Deliberately carries no `id` term: at the magnitude `priority_class * 1e13`
    /// already reaches, the f64 ULP is far wider than any sub-unit fraction an id
    /// could contribute, so folding id in as `id * 1e-6` rounds away completely and
    /// silently collapses distinct ids to the same score. The id tiebreak this
    /// invariant also requires is instead the backend's responsibility to apply
    /// exactly — e.g. by ordering same-score sorted-set members on the id itself
    /// rather than on a lossy composite float.
    pub fn wait_score(priority_class: i32, created_at_ms: i64) -> f64 {
        // priority_class occupies the high digits so it always dominates
        // created_at_ms (epoch-ms comfortably fits under 10^13 until year 2286).
        (priority_class as f64) * 1e13 + (created_at_ms as f64)
    }
}

/// A repeatable (cron) template record (§4.2 `EnqueueRepeatable`, §4.3 expansion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatableTemplate {
    pub repeat_id: String,
    pub queue: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub cron: String,
    pub timezone: String,
    pub opts: EnqueueOpts,
    /// The fire time (ms) the currently-live concrete job was scheduled for, if any.
    pub last_fire_ms: Option<i64>,
}

/// A lifecycle event emitted on the Event Bus (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub queue: String,
    pub job_id: u64,
    pub kind: JobEventKind,
    pub at_ms: i64,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
    Error,
    Paused,
    Resumed,
}

/// O(1) cardinality counters returned by `Stats` (§4.2, §4.8).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}
