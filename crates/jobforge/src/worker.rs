//! The Worker Pool (C6): per-queue concurrent workers that pop, run the
//! handler with a timeout, renew the lease, and report the outcome (§4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelHandle;
use crate::clock::Clock;
use crate::error::HandlerFailure;
use crate::kv::{Kv, PopOutcome};
use crate::registry::{HandlerRegistry, JobContext};
use crate::scheduler::Scheduler;
use crate::types::{JobEvent, JobEventKind, JobRecord};

/// Idle/active worker counters consumed by `HealthCheck` (§4.9, SPEC_FULL
/// §10.6: "Worker heartbeat counters").
#[derive(Default)]
pub struct WorkerHeartbeat {
    idle: AtomicU32,
    active: AtomicU32,
}

impl WorkerHeartbeat {
    pub fn idle_count(&self) -> u32 {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    fn mark_idle(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.idle.fetch_sub(1, Ordering::Relaxed);
    }

    fn mark_done(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.idle.fetch_add(1, Ordering::Relaxed);
    }
}

/// Backoff applied once consecutive KV pop errors exceed `kv_retry_attempts`
/// (§7 "Propagation policy"): doubles per attempt past the cap, starting from
/// `idle_backoff_ms`, itself capped at 30s so a prolonged outage doesn't stop
/// the worker from noticing recovery for minutes at a time.
fn kv_error_backoff_ms(idle_backoff_ms: i64, backoff_attempt: u32) -> u64 {
    const MAX_MS: u64 = 30_000;
    let shift = backoff_attempt.min(16);
    let base = (idle_backoff_ms.max(1) as u64).saturating_mul(1u64 << shift);
    base.min(MAX_MS)
}

/// Runs `queue.concurrency` worker tasks against `queue_name`. There is no
/// shared mutable in-process state here beyond the Event Bus and this pool's
/// own wake-up `Notify` and heartbeat counters (§4.4, §5).
pub struct WorkerPool<K: Kv> {
    queue_name: String,
    scheduler: Arc<Scheduler<K>>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    heartbeat: Arc<WorkerHeartbeat>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    idle_backoff_ms: i64,
    kv_retry_attempts: u32,
}

impl<K: Kv> WorkerPool<K> {
    pub fn new(
        queue_name: impl Into<String>,
        scheduler: Arc<Scheduler<K>>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        idle_backoff_ms: i64,
        kv_retry_attempts: u32,
    ) -> Self {
        WorkerPool {
            queue_name: queue_name.into(),
            scheduler,
            handlers,
            clock,
            heartbeat: Arc::new(WorkerHeartbeat::default()),
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            idle_backoff_ms,
            kv_retry_attempts,
        }
    }

    pub fn heartbeat(&self) -> Arc<WorkerHeartbeat> {
        self.heartbeat.clone()
    }

    /// Wakes every idle worker immediately, used when the Scheduler observes
    /// a `new-waiting` event instead of making workers poll blindly (§4.4 step 1).
    pub fn notify_waiting(&self) {
        self.wake.notify_waiters();
    }

    /// Signals every worker to stop popping new jobs; in-flight jobs finish
    /// under their own `job_timeout_ms` (§4.9).
    pub fn begin_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Spawns `concurrency` worker tasks, each of which loops until shutdown.
    /// Returns their join handles so the Lifecycle Manager can await them
    /// during a graceful shutdown.
    pub fn spawn(self: &Arc<Self>, concurrency: u32) -> Vec<tokio::task::JoinHandle<()>> {
        (0..concurrency)
            .map(|worker_index| {
                let pool = self.clone();
                tokio::spawn(async move { pool.run_worker(worker_index).await })
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, worker_index: u32) {
        let mut shutting_down = false;
        let mut consecutive_kv_errors: u32 = 0;
        loop {
            if shutting_down {
                break;
            }
            self.heartbeat.mark_idle();
            let outcome = match self.scheduler.pop_and_lease(&self.queue_name).await {
                Ok(outcome) => {
                    consecutive_kv_errors = 0;
                    outcome
                }
                Err(err) => {
                    consecutive_kv_errors += 1;
                    if consecutive_kv_errors <= self.kv_retry_attempts {
                        warn!(queue = %self.queue_name, worker_index, error = %err, attempt = consecutive_kv_errors, "pop failed, retrying");
                        tokio::time::sleep(Duration::from_millis(self.idle_backoff_ms as u64)).await;
                        continue;
                    }
                    error!(queue = %self.queue_name, worker_index, error = %err, "pop failed after {} retries, backing off", self.kv_retry_attempts);
                    if consecutive_kv_errors == self.kv_retry_attempts + 1 {
                        self.scheduler.events().emit(JobEvent {
                            queue: self.queue_name.clone(),
                            job_id: 0,
                            kind: JobEventKind::Error,
                            at_ms: self.clock.now_ms(),
                            data: Some(err.to_string()),
                        });
                    }
                    let backoff_attempt = consecutive_kv_errors - self.kv_retry_attempts;
                    let backoff_ms = kv_error_backoff_ms(self.idle_backoff_ms, backoff_attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = self.shutdown.notified() => { shutting_down = true; }
                    }
                    continue;
                }
            };

            match outcome {
                PopOutcome::Leased(job) => {
                    self.heartbeat.mark_active();
                    self.run_job(job).await;
                    self.heartbeat.mark_done();
                }
                PopOutcome::Empty => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(self.idle_backoff_ms as u64)) => {}
                        _ = self.shutdown.notified() => { shutting_down = true; }
                    }
                }
                PopOutcome::Throttled { retry_after_ms } => {
                    let sleep_ms = retry_after_ms.max(0) as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                        _ = self.shutdown.notified() => { shutting_down = true; }
                    }
                }
            }
        }
        debug!(queue = %self.queue_name, worker_index, "worker stopped");
    }

    async fn run_job(&self, job: JobRecord) {
        let Some(handler) = self.handlers.get(&job.kind) else {
            warn!(queue = %self.queue_name, job_id = job.id, kind = %job.kind, "no handler registered");
            let _ = self
                .scheduler
                .report_failure(
                    &self.queue_name,
                    &job,
                    HandlerFailure::Permanent(format!("HANDLER_MISSING: {}", job.kind)),
                )
                .await;
            return;
        };

        let (cancel_handle, cancel_token) = CancelHandle::new();
        let renewal = self.spawn_lease_renewal(job.id, job.timeout_ms, &cancel_handle);

        let ctx = JobContext {
            queue: self.queue_name.clone(),
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempts_made,
            payload: job.payload.clone(),
            cancel: cancel_token,
        };

        let run = handler.handle(ctx);
        let result = timeout(Duration::from_millis(job.timeout_ms.max(0) as u64), run).await;
        renewal.abort();

        match result {
            Ok(Ok(output)) => {
                if let Err(err) = self.scheduler.report_success(&self.queue_name, &job, output).await {
                    error!(queue = %self.queue_name, job_id = job.id, error = %err, "failed to record completion");
                }
            }
            Ok(Err(failure)) => {
                if let Err(err) = self.scheduler.report_failure(&self.queue_name, &job, failure).await {
                    error!(queue = %self.queue_name, job_id = job.id, error = %err, "failed to record failure");
                }
            }
            Err(_elapsed) => {
                cancel_handle.cancel();
                info!(queue = %self.queue_name, job_id = job.id, "handler timed out");
                if let Err(err) = self
                    .scheduler
                    .report_failure(
                        &self.queue_name,
                        &job,
                        HandlerFailure::Retryable("TIMEOUT".to_string()),
                    )
                    .await
                {
                    error!(queue = %self.queue_name, job_id = job.id, error = %err, "failed to record timeout");
                }
            }
        }
    }

    /// §4.4 step 3: a timer at `job_timeout_ms / 3` that extends the lease
    /// while the handler runs. If renewal ever fails (KV unavailable), the
    /// worker's cancel token fires so the handler can cooperatively abort and
    /// the Stalled-Job Detector reclaims the job instead.
    fn spawn_lease_renewal(
        &self,
        job_id: u64,
        job_timeout_ms: i64,
        cancel_handle: &CancelHandle,
    ) -> tokio::task::JoinHandle<()> {
        let interval_ms = (job_timeout_ms / 3).max(1) as u64;
        let scheduler = self.scheduler.clone();
        let queue_name = self.queue_name.clone();
        let clock = self.clock.clone();
        let cancel = cancel_handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                let new_lease_until = clock.now_ms() + job_timeout_ms;
                match scheduler.renew_lease(&queue_name, job_id, new_lease_until).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(queue = %queue_name, job_id, "lease lost; job likely reclaimed as stalled");
                        cancel.cancel();
                        break;
                    }
                    Err(err) => {
                        warn!(queue = %queue_name, job_id, error = %err, "lease renewal failed");
                        cancel.cancel();
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_error_backoff_doubles_then_caps() {
        assert_eq!(kv_error_backoff_ms(200, 1), 400);
        assert_eq!(kv_error_backoff_ms(200, 2), 800);
        assert_eq!(kv_error_backoff_ms(200, 10), 30_000);
    }

    #[test]
    fn kv_error_backoff_never_overflows_on_huge_attempts() {
        assert_eq!(kv_error_backoff_ms(1, u32::MAX), 30_000);
    }
}
