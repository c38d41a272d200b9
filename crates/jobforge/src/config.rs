//! Engine-wide tunables, layered code-defaults -> config file -> environment
//! the way this codebase's dependents configure themselves (§10.2).

use serde::{Deserialize, Serialize};

/// Tunables that apply across every queue the engine manages. Individual
/// queue policy (concurrency, rate limit, retry defaults) lives in
/// [`crate::types::Queue`] instead; this struct is the Scheduler/Detector/
/// Lifecycle Manager's own operational knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often the Scheduler's promotion loop moves `delayed` -> `wait` (§4.3).
    pub promotion_interval_ms: i64,
    /// How often the Stalled-Job Detector scans `active` for expired leases (§4.6).
    pub stall_check_interval_ms: i64,
    /// Reclaims beyond this many are terminal failures (§4.6 default 1).
    pub max_stalls: u32,
    /// Added to `job_timeout_ms` when computing `lease_until` so a lease
    /// outlives the handler's own deadline by a safety margin (§4.3 step 3).
    pub lease_buffer_ms: i64,
    /// Default retention window applied when a queue doesn't override
    /// `retain_on_completion`/`retain_on_failure` with its own clean cadence.
    pub default_retention_ms: i64,
    /// Batch size for `Admin::clean` (§4.8: "MUST operate in bounded batches").
    pub clean_batch_size: u32,
    /// How long `Shutdown` waits for in-flight jobs before cancelling them (§4.9).
    pub shutdown_grace_period_ms: i64,
    /// Idle backoff a worker sleeps after an `EMPTY` pop before trying again (§4.4).
    pub idle_backoff_ms: i64,
    /// How many times the Scheduler retries a pop after a KV error before
    /// emitting an `error` event and backing off pop pressure (§7).
    pub kv_retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            promotion_interval_ms: 100,
            stall_check_interval_ms: 30_000,
            max_stalls: 1,
            lease_buffer_ms: 5_000,
            default_retention_ms: 24 * 60 * 60 * 1000,
            clean_batch_size: 1_000,
            shutdown_grace_period_ms: 30_000,
            idle_backoff_ms: 200,
            kv_retry_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Loads layered configuration: compiled-in defaults, then an optional
    /// TOML file, then `JOBFORGE_*` environment overrides — the same
    /// precedence order this codebase's other services use via the `config` crate.
    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("JOBFORGE"));
        builder.build()?.try_deserialize()
    }
}
