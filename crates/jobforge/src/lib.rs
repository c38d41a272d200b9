//! # jobforge
//!
//! A multi-tenant background job engine: per-queue concurrency limits, rate
//! limiting, prioritization, retries with exponential backoff, delayed and
//! recurring (cron) scheduling, at-least-once delivery, and operational
//! visibility (statistics, inspection, retry, pause/resume, cleanup).
//!
//! ## Architecture
//!
//! ```text
//! Producer ──enqueue()──► Scheduler ──► KV store (wait / delayed / active / ...)
//!                             ▲                │
//!                             │          pop_and_lease()
//!                             │                ▼
//!                        Worker Pool ──run handler──► success/failure
//!                             │
//!                     lease renewal ticker
//!
//! Stalled-Job Detector ──reclaim_stalled()──► KV store (per-process ticker)
//! ```
//!
//! This crate holds the engine core only: queue/job types, the [`Kv`] trait
//! every backend implements, the Scheduler, Worker Pool, Stalled-Job
//! Detector, Admin Surface, Event Bus, and the `Engine`/`EngineHandle`
//! Lifecycle Manager. No concrete KV backend lives here — see
//! `jobforge-redis` for the production Redis-protocol implementation and
//! `jobforge-testing` for an in-memory one used by this crate's own tests.
//!
//! ## What this is not
//!
//! Not exactly-once delivery, not cross-cluster replication, not a workflow
//! DAG orchestrator, and not a transport — producers call the engine
//! in-process or through whatever thin adapter the host builds.

mod admin;
mod backoff;
mod cancel;
mod clock;
mod config;
mod engine;
mod error;
mod events;
mod kv;
mod registry;
mod repeatable;
mod scheduler;
mod stalled;
mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use admin::Admin;
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineHandle, HealthReport, QueueHealth};
pub use error::{EngineError, HandlerFailure, KvError};
pub use events::EventBus;
pub use kv::{EnqueueOutcome, Kv, Page, PopOutcome, RateLimitOutcome, StalledOutcome, TerminalStatus};
pub use registry::{Handler, HandlerRegistry, JobContext, QueueRegistry};
pub use scheduler::Scheduler;
pub use stalled::StalledDetector;
pub use types::{
    Backoff, BackoffStrategy, EnqueueOpts, JobEvent, JobEventKind, JobRecord, JobState, Queue,
    QueueDefaults, QueueStats, RateLimit, RepeatableTemplate, DEFAULT_PRIORITY_CLASS,
};
pub use worker::{WorkerHeartbeat, WorkerPool};

pub use async_trait::async_trait;
