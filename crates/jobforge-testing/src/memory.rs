//! [`InMemoryKv`]: an in-process, single-node stand-in for the KV store
//! (C1), implementing every atomic operation `jobforge::Kv` requires behind
//! one `tokio::sync::Mutex` per call. Atomicity "for free" since the whole
//! store is guarded by a single lock and every method is one critical
//! section — the property the scripted transactions in `jobforge-redis`
//! have to earn with Lua, this crate gets from `std`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{broadcast, Mutex};

use jobforge::{
    EnqueueOpts, EnqueueOutcome, JobEvent, JobRecord, JobState, Kv, KvError, Page, PopOutcome,
    QueueStats, RateLimit, RateLimitOutcome, RepeatableTemplate, StalledOutcome, TerminalStatus,
};

use crate::sorted_set::SortedSet;

#[derive(Debug, Default)]
struct QueueState {
    id_counter: u64,
    jobs: HashMap<u64, JobRecord>,
    wait: SortedSet,
    delayed: SortedSet,
    active: SortedSet,
    completed: SortedSet,
    failed: SortedSet,
    paused: bool,
    rate_limit: Option<RateLimit>,
    rl_tokens: Option<u32>,
    rl_reset_at_ms: Option<i64>,
    keep_completed: u64,
    keep_failed: u64,
    /// `dedup_key -> job id`, entries removed once the job leaves `wait`,
    /// `delayed`, or `active` (i.e. once it is no longer "live", §4.2).
    dedup_live: HashMap<String, u64>,
    repeatables: HashMap<String, RepeatableTemplate>,
}

impl QueueState {
    fn trim_retention(&mut self, status: TerminalStatus) {
        let keep = match status {
            TerminalStatus::Completed => self.keep_completed,
            TerminalStatus::Failed => self.keep_failed,
        };
        if keep == 0 {
            return;
        }
        let len = match status {
            TerminalStatus::Completed => self.completed.len(),
            TerminalStatus::Failed => self.failed.len(),
        };
        let excess = len.saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let victims = match status {
            TerminalStatus::Completed => self.completed.oldest(excess),
            TerminalStatus::Failed => self.failed.oldest(excess),
        };
        for id in victims {
            match status {
                TerminalStatus::Completed => self.completed.remove(id),
                TerminalStatus::Failed => self.failed.remove(id),
            };
            self.jobs.remove(&id);
        }
    }
}

/// An in-memory [`jobforge::Kv`] backend: one lock-guarded map of per-queue
/// state plus a broadcast channel standing in for the `jq:events` pub/sub
/// channel. Suitable for unit/integration tests and local development; not
/// durable and not shared across processes.
pub struct InMemoryKv {
    queues: Mutex<HashMap<String, QueueState>>,
    events: broadcast::Sender<JobEvent>,
}

impl InMemoryKv {
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(InMemoryKv {
            queues: Mutex::new(HashMap::new()),
            events,
        })
    }

    async fn with_queue<R>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut QueueState) -> R,
    ) -> R {
        let mut guard = self.queues.lock().await;
        let state = guard.entry(queue.to_string()).or_default();
        f(state)
    }
}

#[async_trait]
impl Kv for InMemoryKv {
    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn configure_queue(
        &self,
        queue: &str,
        rate_limit: Option<RateLimit>,
        keep_completed: u64,
        keep_failed: u64,
    ) -> Result<(), KvError> {
        self.with_queue(queue, |s| {
            s.rate_limit = rate_limit;
            s.keep_completed = keep_completed;
            s.keep_failed = keep_failed;
        })
        .await;
        Ok(())
    }

    async fn next_id(&self, queue: &str) -> Result<u64, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                s.id_counter += 1;
                s.id_counter
            })
            .await)
    }

    async fn enqueue(&self, job: JobRecord, _now_ms: i64) -> Result<EnqueueOutcome, KvError> {
        Ok(self
            .with_queue(&job.queue.clone(), |s| {
                if let Some(key) = &job.dedup_key {
                    if s.dedup_live.contains_key(key) {
                        return EnqueueOutcome::Duplicate;
                    }
                    s.dedup_live.insert(key.clone(), job.id);
                }
                let id = job.id;
                match job.state {
                    JobState::Waiting => {
                        let score = JobRecord::wait_score(job.priority_class, job.created_at_ms);
                        s.wait.insert(score, id);
                    }
                    JobState::Delayed => {
                        s.delayed.insert(job.available_at_ms as f64, id);
                    }
                    other => unreachable!("enqueue only produces waiting/delayed jobs, got {other:?}"),
                }
                s.jobs.insert(id, job);
                EnqueueOutcome::Inserted
            })
            .await)
    }

    async fn promote_due(&self, queue: &str, now_ms: i64) -> Result<Vec<u64>, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                let due = s.delayed.due(now_ms as f64);
                for id in &due {
                    s.delayed.remove(*id);
                    if let Some(job) = s.jobs.get_mut(id) {
                        job.state = JobState::Waiting;
                        let score = JobRecord::wait_score(job.priority_class, job.created_at_ms);
                        s.wait.insert(score, *id);
                    }
                }
                due
            })
            .await)
    }

    async fn pop_and_lease(
        &self,
        queue: &str,
        now_ms: i64,
        lease_buffer_ms: i64,
    ) -> Result<PopOutcome, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                if s.paused {
                    return PopOutcome::Empty;
                }

                let mut token_taken = false;
                if let Some(rl) = s.rate_limit {
                    let reset_due = s.rl_reset_at_ms.map(|r| now_ms >= r).unwrap_or(true);
                    if reset_due {
                        s.rl_tokens = Some(rl.max);
                        s.rl_reset_at_ms = Some(now_ms + rl.window_ms);
                    }
                    let tokens = s.rl_tokens.unwrap_or(rl.max);
                    if tokens == 0 {
                        let retry_after_ms = s.rl_reset_at_ms.unwrap_or(now_ms) - now_ms;
                        return PopOutcome::Throttled { retry_after_ms };
                    }
                    s.rl_tokens = Some(tokens - 1);
                    token_taken = true;
                }

                let Some((_, id)) = s.wait.pop_min() else {
                    if token_taken {
                        if let Some(rl) = s.rate_limit {
                            let tokens = s.rl_tokens.unwrap_or(0);
                            s.rl_tokens = Some((tokens + 1).min(rl.max));
                        }
                    }
                    return PopOutcome::Empty;
                };

                let job = s.jobs.get_mut(&id).expect("wait member has a record");
                let lease_until = now_ms + job.timeout_ms + lease_buffer_ms;
                job.state = JobState::Active;
                job.lease_until_ms = Some(lease_until);
                if job.first_attempted_at_ms.is_none() {
                    job.first_attempted_at_ms = Some(now_ms);
                }
                job.attempts_made += 1;
                s.active.insert(lease_until as f64, id);
                PopOutcome::Leased(job.clone())
            })
            .await)
    }

    async fn renew_lease(
        &self,
        queue: &str,
        job_id: u64,
        new_lease_until_ms: i64,
    ) -> Result<bool, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                if !s.active.contains(job_id) {
                    return false;
                }
                s.active.insert(new_lease_until_ms as f64, job_id);
                if let Some(job) = s.jobs.get_mut(&job_id) {
                    job.lease_until_ms = Some(new_lease_until_ms);
                }
                true
            })
            .await)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: u64,
        result: Vec<u8>,
        now_ms: i64,
    ) -> Result<(), KvError> {
        self.with_queue(queue, |s| {
            s.active.remove(job_id);
            let retain = s.jobs.get(&job_id).map(|j| j.retain_on_completion).unwrap_or(true);
            if let Some(key) = s.jobs.get(&job_id).and_then(|j| j.dedup_key.clone()) {
                s.dedup_live.remove(&key);
            }
            if !retain {
                s.jobs.remove(&job_id);
                return;
            }
            if let Some(job) = s.jobs.get_mut(&job_id) {
                job.state = JobState::Completed;
                job.finished_at_ms = Some(now_ms);
                job.result = Some(result);
            }
            s.completed.insert(now_ms as f64, job_id);
            s.trim_retention(TerminalStatus::Completed);
        })
        .await;
        Ok(())
    }

    async fn fail_retry(
        &self,
        queue: &str,
        job_id: u64,
        now_ms: i64,
        delay_ms: i64,
        last_error: String,
    ) -> Result<(), KvError> {
        self.with_queue(queue, |s| {
            s.active.remove(job_id);
            let available_at = now_ms + delay_ms;
            if let Some(job) = s.jobs.get_mut(&job_id) {
                job.state = JobState::Delayed;
                job.available_at_ms = available_at;
                job.last_error = Some(last_error);
            }
            s.delayed.insert(available_at as f64, job_id);
        })
        .await;
        Ok(())
    }

    async fn fail_terminal(
        &self,
        queue: &str,
        job_id: u64,
        now_ms: i64,
        last_error: String,
    ) -> Result<(), KvError> {
        self.with_queue(queue, |s| {
            s.active.remove(job_id);
            let retain = s.jobs.get(&job_id).map(|j| j.retain_on_failure).unwrap_or(true);
            if let Some(key) = s.jobs.get(&job_id).and_then(|j| j.dedup_key.clone()) {
                s.dedup_live.remove(&key);
            }
            if !retain {
                s.jobs.remove(&job_id);
                return;
            }
            if let Some(job) = s.jobs.get_mut(&job_id) {
                job.state = JobState::Failed;
                job.finished_at_ms = Some(now_ms);
                job.last_error = Some(last_error);
            }
            s.failed.insert(now_ms as f64, job_id);
            s.trim_retention(TerminalStatus::Failed);
        })
        .await;
        Ok(())
    }

    async fn take_token(
        &self,
        queue: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<RateLimitOutcome, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                let reset_due = s.rl_reset_at_ms.map(|r| now_ms >= r).unwrap_or(true);
                if reset_due {
                    s.rl_tokens = Some(max);
                    s.rl_reset_at_ms = Some(now_ms + window_ms);
                }
                let tokens = s.rl_tokens.unwrap_or(max);
                if tokens == 0 {
                    let retry_after_ms = s.rl_reset_at_ms.unwrap_or(now_ms) - now_ms;
                    RateLimitOutcome::Throttled { retry_after_ms }
                } else {
                    s.rl_tokens = Some(tokens - 1);
                    RateLimitOutcome::Ok
                }
            })
            .await)
    }

    async fn reclaim_stalled(
        &self,
        queue: &str,
        now_ms: i64,
        max_stalls: u32,
    ) -> Result<Vec<StalledOutcome>, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                let expired = s.active.due(now_ms as f64);
                let mut out = Vec::with_capacity(expired.len());
                for id in expired {
                    if s.active.remove(id).is_none() {
                        continue;
                    }
                    let job = s.jobs.get_mut(&id).expect("active member has a record");
                    job.stall_count += 1;
                    if job.stall_count > max_stalls {
                        job.state = JobState::Failed;
                        job.finished_at_ms = Some(now_ms);
                        job.last_error = Some("stalled: lease expired too many times".to_string());
                        s.failed.insert(now_ms as f64, id);
                        out.push(StalledOutcome::Terminated { job_id: id });
                    } else {
                        job.state = JobState::Waiting;
                        let score = JobRecord::wait_score(job.priority_class, job.created_at_ms);
                        s.wait.insert(score, id);
                        out.push(StalledOutcome::Requeued {
                            job_id: id,
                            stall_count: job.stall_count,
                        });
                    }
                }
                out
            })
            .await)
    }

    async fn get_job(&self, queue: &str, job_id: u64) -> Result<Option<JobRecord>, KvError> {
        Ok(self.with_queue(queue, |s| s.jobs.get(&job_id).cloned()).await)
    }

    async fn remove_job(&self, queue: &str, job_id: u64, now_ms: i64) -> Result<bool, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                if let Some(lease) = s.active.score(job_id) {
                    if lease > now_ms as f64 {
                        return false;
                    }
                }
                s.wait.remove(job_id);
                s.delayed.remove(job_id);
                s.active.remove(job_id);
                s.completed.remove(job_id);
                s.failed.remove(job_id);
                if let Some(job) = s.jobs.remove(&job_id) {
                    if let Some(key) = job.dedup_key {
                        s.dedup_live.remove(&key);
                    }
                }
                true
            })
            .await)
    }

    async fn retry_job(&self, queue: &str, job_id: u64, now_ms: i64) -> Result<bool, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                if s.failed.remove(job_id).is_none() {
                    return false;
                }
                let Some(job) = s.jobs.get_mut(&job_id) else {
                    return false;
                };
                job.state = JobState::Waiting;
                job.attempts_made = 0;
                job.available_at_ms = now_ms;
                job.created_at_ms = now_ms;
                job.finished_at_ms = None;
                let score = JobRecord::wait_score(job.priority_class, now_ms);
                s.wait.insert(score, job_id);
                true
            })
            .await)
    }

    async fn pause(&self, queue: &str) -> Result<(), KvError> {
        self.with_queue(queue, |s| s.paused = true).await;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), KvError> {
        self.with_queue(queue, |s| s.paused = false).await;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, KvError> {
        Ok(self.with_queue(queue, |s| s.paused).await)
    }

    async fn clean(
        &self,
        queue: &str,
        status: TerminalStatus,
        older_than_ms: i64,
        batch_size: u32,
    ) -> Result<u64, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                let set = match status {
                    TerminalStatus::Completed => &mut s.completed,
                    TerminalStatus::Failed => &mut s.failed,
                };
                let victims = set.due_limited(older_than_ms as f64, batch_size as usize);
                for id in &victims {
                    set.remove(*id);
                }
                let removed = victims.len() as u64;
                for id in victims {
                    s.jobs.remove(&id);
                }
                removed
            })
            .await)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, KvError> {
        Ok(self
            .with_queue(queue, |s| QueueStats {
                waiting: s.wait.len(),
                active: s.active.len(),
                completed: s.completed.len(),
                failed: s.failed.len(),
                delayed: s.delayed.len(),
                paused: s.paused,
            })
            .await)
    }

    async fn inspect(
        &self,
        queue: &str,
        status: TerminalStatus,
        from: u64,
        to: u64,
    ) -> Result<Page, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                let set = match status {
                    TerminalStatus::Completed => &s.completed,
                    TerminalStatus::Failed => &s.failed,
                };
                let ids = set.page(from, to);
                let jobs = ids
                    .into_iter()
                    .filter_map(|id| s.jobs.get(&id).cloned())
                    .collect();
                Page {
                    jobs,
                    total: set.len(),
                }
            })
            .await)
    }

    async fn put_repeatable(&self, template: &RepeatableTemplate) -> Result<(), KvError> {
        self.with_queue(&template.queue.clone(), |s| {
            s.repeatables.insert(template.repeat_id.clone(), template.clone());
        })
        .await;
        Ok(())
    }

    async fn get_repeatable(
        &self,
        queue: &str,
        repeat_id: &str,
    ) -> Result<Option<RepeatableTemplate>, KvError> {
        Ok(self
            .with_queue(queue, |s| s.repeatables.get(repeat_id).cloned())
            .await)
    }

    async fn list_repeatables(&self, queue: &str) -> Result<Vec<RepeatableTemplate>, KvError> {
        Ok(self
            .with_queue(queue, |s| s.repeatables.values().cloned().collect())
            .await)
    }

    async fn has_live_concrete(&self, queue: &str, repeat_id: &str) -> Result<bool, KvError> {
        Ok(self
            .with_queue(queue, |s| {
                [&s.wait, &s.delayed, &s.active]
                    .into_iter()
                    .any(|set| {
                        set.iter_ids()
                            .any(|id| s.jobs.get(&id).map(|j| j.repeat_id.as_deref() == Some(repeat_id)).unwrap_or(false))
                    })
            })
            .await)
    }

    async fn publish_event(&self, event: &JobEvent) -> Result<(), KvError> {
        let _ = self.events.send(event.clone());
        Ok(())
    }

    fn subscribe_events(&self) -> Pin<Box<dyn Stream<Item = JobEvent> + Send>> {
        let rx = self.events.subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }
}
