//! The error taxonomy surfaced to producers, admins, and the Scheduler itself.

use thiserror::Error;

/// Every failure mode named in the engine's error handling design.
///
/// Handler errors are captured into [`crate::types::JobRecord::last_error`] and
/// drive the retry ladder; they are never rethrown through this enum. `EngineError`
/// is reserved for producer/admin-facing API failures and internal KV failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("queue {0:?} is not registered")]
    QueueUnknown(String),

    #[error("no handler registered for kind {0:?}")]
    HandlerMissing(String),

    #[error("a live job with dedup_key {0:?} already exists")]
    Duplicate(String),

    #[error("scheduled time is in the past")]
    PastSchedule,

    #[error("job {0} is leased and cannot be mutated")]
    Busy(u64),

    #[error("rate limit budget exhausted; retry after {retry_after_ms}ms")]
    Throttled { retry_after_ms: i64 },

    #[error("operation timed out")]
    Timeout,

    #[error("job exceeded max_stalls reclaims")]
    Stalled,

    #[error("handler opted out of retries: {0}")]
    Permanent(String),

    #[error("KV store unavailable: {0}")]
    KvUnavailable(#[from] KvError),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("job {queue}/{id} not found")]
    NotFound { queue: String, id: u64 },
}

impl EngineError {
    /// Mirrors the Scheduler's own retry-vs-terminal branch so callers don't
    /// have to match every variant to decide whether to back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::KvUnavailable(_) | EngineError::Throttled { .. } | EngineError::Timeout
        )
    }
}

/// Errors raised by a [`crate::kv::Kv`] backend. Kept separate from
/// `EngineError` so backend crates (e.g. `jobforge-redis`) don't need to
/// depend on the full engine error enum.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found")]
    NotFound,
}

/// The outcome a handler reports back to the Worker Pool.
#[derive(Debug, Error)]
pub enum HandlerFailure {
    /// A transient failure; counts against `attempts_max` and is retried with backoff.
    #[error("{0}")]
    Retryable(String),

    /// The sentinel handlers use to bypass the retry ladder entirely.
    #[error("{0}")]
    Permanent(String),
}
