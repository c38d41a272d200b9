//! The Scheduler (C5): promotion, pop-and-lease, retry scheduling,
//! completion, and repeatable-template expansion (§4.3).

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::retry_delay_ms;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, HandlerFailure};
use crate::events::EventBus;
use crate::kv::{EnqueueOutcome, Kv, PopOutcome};
use crate::registry::QueueRegistry;
use crate::repeatable::{next_fire_after, parse_schedule, parse_timezone};
use crate::types::{
    Backoff, EnqueueOpts, JobEvent, JobEventKind, JobRecord, JobState, RepeatableTemplate,
    DEFAULT_PRIORITY_CLASS,
};

/// Runs the promotion loop and mediates pop/complete/fail for every queue
/// attached to this process. One `Scheduler` is shared by every queue's
/// Worker Pool and Stalled-Job Detector within a process.
pub struct Scheduler<K: Kv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
    registry: Arc<QueueRegistry>,
    events: EventBus,
    config: EngineConfig,
}

impl<K: Kv> Scheduler<K> {
    pub fn new(
        kv: Arc<K>,
        clock: Arc<dyn Clock>,
        registry: Arc<QueueRegistry>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Scheduler {
            kv,
            clock,
            registry,
            events,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// §4.2 `Enqueue`. Allocates an id, validates the queue exists, resolves
    /// options against queue defaults, and atomically inserts the job into
    /// `wait` or `delayed`.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        kind: &str,
        payload: Vec<u8>,
        opts: EnqueueOpts,
    ) -> Result<u64, EngineError> {
        let queue = self
            .registry
            .get(queue_name)
            .ok_or_else(|| EngineError::QueueUnknown(queue_name.to_string()))?;

        let now = self.now_ms();
        let id = self.kv.next_id(queue_name).await?;
        let delay_ms = opts.delay_ms.unwrap_or(0).max(0);
        let backoff = opts.backoff.unwrap_or(queue.defaults.backoff);
        let dedup_key = opts.dedup_key.clone();
        let job = JobRecord {
            id,
            queue: queue_name.to_string(),
            kind: kind.to_string(),
            payload,
            priority_class: opts.priority_class.unwrap_or(DEFAULT_PRIORITY_CLASS),
            attempts_made: 0,
            attempts_max: opts.attempts.unwrap_or(queue.defaults.attempts),
            backoff_strategy: backoff.strategy,
            backoff_base_ms: backoff.base_ms,
            backoff_max_ms: backoff.max_ms,
            timeout_ms: opts.timeout_ms.unwrap_or(queue.defaults.timeout_ms),
            state: if delay_ms > 0 {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            available_at_ms: now + delay_ms,
            lease_until_ms: None,
            created_at_ms: now,
            first_attempted_at_ms: None,
            finished_at_ms: None,
            result: None,
            last_error: None,
            stall_count: 0,
            dedup_key,
            repeat_id: None,
            retain_on_completion: opts
                .retain_on_completion
                .unwrap_or(queue.defaults.retain_on_completion),
            retain_on_failure: opts
                .retain_on_failure
                .unwrap_or(queue.defaults.retain_on_failure),
        };

        match self.kv.enqueue(job, now).await? {
            EnqueueOutcome::Inserted => {
                self.publish(queue_name, id, JobEventKind::Waiting, now, None)
                    .await;
                Ok(id)
            }
            EnqueueOutcome::Duplicate => Err(EngineError::Duplicate(
                opts.dedup_key.unwrap_or_default(),
            )),
        }
    }

    /// §4.2 `EnqueueScheduled` — rejects times in the past.
    pub async fn enqueue_scheduled(
        &self,
        queue_name: &str,
        kind: &str,
        payload: Vec<u8>,
        at_ms: i64,
        opts: EnqueueOpts,
    ) -> Result<u64, EngineError> {
        let now = self.now_ms();
        if at_ms <= now {
            return Err(EngineError::PastSchedule);
        }
        let mut opts = opts;
        opts.delay_ms = Some(at_ms - now);
        self.enqueue(queue_name, kind, payload, opts).await
    }

    /// §4.2 `EnqueueRepeatable`. Registers the template and expands its first
    /// concrete job immediately (the template always has exactly one live
    /// concrete job at a time, per §4.3).
    pub async fn enqueue_repeatable(
        &self,
        queue_name: &str,
        kind: &str,
        payload: Vec<u8>,
        cron_expr: &str,
        timezone: &str,
        opts: EnqueueOpts,
    ) -> Result<String, EngineError> {
        self.registry
            .get(queue_name)
            .ok_or_else(|| EngineError::QueueUnknown(queue_name.to_string()))?;
        let schedule = parse_schedule(cron_expr)?;
        let tz = parse_timezone(timezone)?;
        let repeat_id = Uuid::new_v4().to_string();
        let now = self.now_ms();
        let first_fire = next_fire_after(&schedule, tz, now)
            .ok_or_else(|| EngineError::Permanent("cron schedule never fires".into()))?;

        let template = RepeatableTemplate {
            repeat_id: repeat_id.clone(),
            queue: queue_name.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            cron: cron_expr.to_string(),
            timezone: timezone.to_string(),
            opts: opts.clone(),
            last_fire_ms: Some(first_fire),
        };
        self.kv.put_repeatable(&template).await?;

        let mut concrete_opts = opts;
        concrete_opts.delay_ms = Some((first_fire - now).max(0));
        self.enqueue_repeat_concrete(queue_name, kind, payload, &repeat_id, concrete_opts)
            .await?;
        Ok(repeat_id)
    }

    async fn enqueue_repeat_concrete(
        &self,
        queue_name: &str,
        kind: &str,
        payload: Vec<u8>,
        repeat_id: &str,
        opts: EnqueueOpts,
    ) -> Result<u64, EngineError> {
        let queue = self
            .registry
            .get(queue_name)
            .ok_or_else(|| EngineError::QueueUnknown(queue_name.to_string()))?;
        let now = self.now_ms();
        let id = self.kv.next_id(queue_name).await?;
        let delay_ms = opts.delay_ms.unwrap_or(0).max(0);
        let backoff = opts.backoff.unwrap_or(queue.defaults.backoff);
        let job = JobRecord {
            id,
            queue: queue_name.to_string(),
            kind: kind.to_string(),
            payload,
            priority_class: opts.priority_class.unwrap_or(DEFAULT_PRIORITY_CLASS),
            attempts_made: 0,
            attempts_max: opts.attempts.unwrap_or(queue.defaults.attempts),
            backoff_strategy: backoff.strategy,
            backoff_base_ms: backoff.base_ms,
            backoff_max_ms: backoff.max_ms,
            timeout_ms: opts.timeout_ms.unwrap_or(queue.defaults.timeout_ms),
            state: JobState::Delayed,
            available_at_ms: now + delay_ms,
            lease_until_ms: None,
            created_at_ms: now,
            first_attempted_at_ms: None,
            finished_at_ms: None,
            result: None,
            last_error: None,
            stall_count: 0,
            dedup_key: None,
            repeat_id: Some(repeat_id.to_string()),
            retain_on_completion: opts
                .retain_on_completion
                .unwrap_or(queue.defaults.retain_on_completion),
            retain_on_failure: opts
                .retain_on_failure
                .unwrap_or(queue.defaults.retain_on_failure),
        };
        match self.kv.enqueue(job, now).await? {
            EnqueueOutcome::Inserted => Ok(id),
            EnqueueOutcome::Duplicate => unreachable!("repeatable concrete jobs carry no dedup_key"),
        }
    }

    /// The promotion loop body (§4.3): move every due `delayed` job on
    /// `queue_name` into `wait`. Called on a timer by the Lifecycle Manager.
    pub async fn promote_due(&self, queue_name: &str) -> Result<Vec<u64>, EngineError> {
        let now = self.now_ms();
        let moved = self.kv.promote_due(queue_name, now).await?;
        for id in &moved {
            self.publish(queue_name, *id, JobEventKind::Waiting, now, None)
                .await;
        }
        Ok(moved)
    }

    /// §4.3 pop-and-lease, called by a Worker. Folds the rate limiter check
    /// and the pop into one atomic backend call.
    pub async fn pop_and_lease(&self, queue_name: &str) -> Result<PopOutcome, EngineError> {
        let queue = self
            .registry
            .get(queue_name)
            .ok_or_else(|| EngineError::QueueUnknown(queue_name.to_string()))?;
        let now = self.now_ms();
        // lease_ms is resolved per job inside the backend from job_timeout_ms;
        // lease_buffer_ms is the engine-wide safety margin added on top (§4.3 step 3).
        let outcome = self
            .kv
            .pop_and_lease(queue_name, now, self.config.lease_buffer_ms)
            .await?;
        match &outcome {
            PopOutcome::Leased(job) => {
                debug!(queue = %queue.name, job_id = job.id, kind = %job.kind, attempt = job.attempts_made, "leased job");
                self.publish(queue_name, job.id, JobEventKind::Active, now, None)
                    .await;
            }
            PopOutcome::Empty => {
                debug!(queue = %queue.name, "pop empty");
            }
            PopOutcome::Throttled { retry_after_ms } => {
                debug!(queue = %queue.name, retry_after_ms, "pop throttled");
            }
        }
        Ok(outcome)
    }

    /// §4.4 step 3: extends a running job's lease. Returns `false` if the
    /// job is no longer active (the Stalled-Job Detector already reclaimed it).
    pub async fn renew_lease(
        &self,
        queue_name: &str,
        job_id: u64,
        new_lease_until_ms: i64,
    ) -> Result<bool, EngineError> {
        Ok(self.kv.renew_lease(queue_name, job_id, new_lease_until_ms).await?)
    }

    /// §4.3 "Completion": handler succeeded.
    pub async fn report_success(
        &self,
        queue_name: &str,
        job: &JobRecord,
        result: Vec<u8>,
    ) -> Result<(), EngineError> {
        let now = self.now_ms();
        self.kv.complete(queue_name, job.id, result, now).await?;
        self.publish(queue_name, job.id, JobEventKind::Completed, now, None)
            .await;
        info!(queue = %queue_name, job_id = job.id, kind = %job.kind, "completed");
        if let Some(repeat_id) = &job.repeat_id {
            self.expand_repeat_if_needed(queue_name, repeat_id, job.available_at_ms)
                .await?;
        }
        Ok(())
    }

    /// §4.3 "Retry scheduling": handler failed.
    pub async fn report_failure(
        &self,
        queue_name: &str,
        job: &JobRecord,
        failure: HandlerFailure,
    ) -> Result<(), EngineError> {
        let now = self.now_ms();
        let message = match &failure {
            HandlerFailure::Retryable(msg) => msg.clone(),
            HandlerFailure::Permanent(msg) => msg.clone(),
        };

        let terminal = matches!(failure, HandlerFailure::Permanent(_))
            || job.attempts_made >= job.attempts_max;

        if terminal {
            self.kv
                .fail_terminal(queue_name, job.id, now, message.clone())
                .await?;
            self.publish(
                queue_name,
                job.id,
                JobEventKind::Failed,
                now,
                Some(message),
            )
            .await;
            warn!(queue = %queue_name, job_id = job.id, kind = %job.kind, "failed terminally");
            if let Some(repeat_id) = &job.repeat_id {
                self.expand_repeat_if_needed(queue_name, repeat_id, job.available_at_ms)
                    .await?;
            }
        } else {
            let backoff = Backoff {
                strategy: job.backoff_strategy,
                base_ms: job.backoff_base_ms,
                max_ms: job.backoff_max_ms,
            };
            let delay_ms = retry_delay_ms(&backoff, job.attempts_made - 1);
            self.kv
                .fail_retry(queue_name, job.id, now, delay_ms, message)
                .await?;
            warn!(queue = %queue_name, job_id = job.id, attempts_made = job.attempts_made, delay_ms, "scheduled retry");
        }
        Ok(())
    }

    /// §4.3 "Repeatable expansion". Computes the next fire strictly after
    /// the just-finished fire time and enqueues one new delayed concrete job.
    async fn expand_repeat_if_needed(
        &self,
        queue_name: &str,
        repeat_id: &str,
        just_finished_fire_ms: i64,
    ) -> Result<(), EngineError> {
        if self.kv.has_live_concrete(queue_name, repeat_id).await? {
            return Ok(());
        }
        let Some(mut template) = self.kv.get_repeatable(queue_name, repeat_id).await? else {
            return Ok(());
        };
        let schedule = parse_schedule(&template.cron)?;
        let tz = parse_timezone(&template.timezone)?;
        let Some(next_fire) = next_fire_after(&schedule, tz, just_finished_fire_ms) else {
            return Ok(());
        };
        let now = self.now_ms();
        let mut opts = template.opts.clone();
        opts.delay_ms = Some((next_fire - now).max(0));
        self.enqueue_repeat_concrete(
            queue_name,
            &template.kind,
            template.payload.clone(),
            repeat_id,
            opts,
        )
        .await?;
        template.last_fire_ms = Some(next_fire);
        self.kv.put_repeatable(&template).await?;
        Ok(())
    }

    /// Crash-recovery sweep (§4.3): for every repeatable template on
    /// `queue_name` with no live concrete job, expand the next fire. Safe to
    /// call repeatedly; a template with a live concrete job is a no-op.
    pub async fn recover_repeatables(&self, queue_name: &str) -> Result<(), EngineError> {
        for template in self.kv.list_repeatables(queue_name).await? {
            let anchor = template.last_fire_ms.unwrap_or_else(|| self.now_ms());
            self.expand_repeat_if_needed(queue_name, &template.repeat_id, anchor)
                .await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        job_id: u64,
        kind: JobEventKind,
        at_ms: i64,
        data: Option<String>,
    ) {
        let event = JobEvent {
            queue: queue.to_string(),
            job_id,
            kind,
            at_ms,
            data,
        };
        self.events.emit(event.clone());
        if let Err(err) = self.kv.publish_event(&event).await {
            warn!(queue, job_id, error = %err, "failed to publish event to KV pub/sub");
        }
    }
}
