//! The Admin Surface (C8, §4.2, §4.8): stats, inspection, manual retry,
//! remove, pause/resume, clean.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::kv::{Kv, Page, TerminalStatus};
use crate::registry::QueueRegistry;
use crate::types::{JobEvent, JobEventKind, JobRecord, QueueStats};

pub struct Admin<K: Kv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
    registry: Arc<QueueRegistry>,
    events: EventBus,
    clean_batch_size: u32,
}

impl<K: Kv> Admin<K> {
    pub fn new(
        kv: Arc<K>,
        clock: Arc<dyn Clock>,
        registry: Arc<QueueRegistry>,
        events: EventBus,
        clean_batch_size: u32,
    ) -> Self {
        Admin {
            kv,
            clock,
            registry,
            events,
            clean_batch_size,
        }
    }

    fn require_queue(&self, queue: &str) -> Result<(), EngineError> {
        self.registry
            .get(queue)
            .map(|_| ())
            .ok_or_else(|| EngineError::QueueUnknown(queue.to_string()))
    }

    pub async fn get_job(&self, queue: &str, id: u64) -> Result<JobRecord, EngineError> {
        self.require_queue(queue)?;
        self.kv
            .get_job(queue, id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                queue: queue.to_string(),
                id,
            })
    }

    /// §4.2 `RemoveJob`: allowed only once the Stalled-Job Detector would
    /// have reclaimed an `active` job; otherwise `BUSY`.
    pub async fn remove_job(&self, queue: &str, id: u64) -> Result<(), EngineError> {
        self.require_queue(queue)?;
        let now = self.clock.now_ms();
        if self.kv.remove_job(queue, id, now).await? {
            Ok(())
        } else {
            Err(EngineError::Busy(id))
        }
    }

    /// §4.2 `Retry`: permitted only in `failed`.
    pub async fn retry(&self, queue: &str, id: u64) -> Result<(), EngineError> {
        self.require_queue(queue)?;
        let now = self.clock.now_ms();
        if self.kv.retry_job(queue, id, now).await? {
            self.events.emit(JobEvent {
                queue: queue.to_string(),
                job_id: id,
                kind: JobEventKind::Waiting,
                at_ms: now,
                data: None,
            });
            Ok(())
        } else {
            Err(EngineError::NotFound {
                queue: queue.to_string(),
                id,
            })
        }
    }

    pub async fn pause(&self, queue: &str) -> Result<(), EngineError> {
        self.require_queue(queue)?;
        self.kv.pause(queue).await?;
        info!(queue, "queue paused");
        self.events.emit(JobEvent {
            queue: queue.to_string(),
            job_id: 0,
            kind: JobEventKind::Paused,
            at_ms: self.clock.now_ms(),
            data: None,
        });
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> Result<(), EngineError> {
        self.require_queue(queue)?;
        self.kv.resume(queue).await?;
        info!(queue, "queue resumed");
        self.events.emit(JobEvent {
            queue: queue.to_string(),
            job_id: 0,
            kind: JobEventKind::Resumed,
            at_ms: self.clock.now_ms(),
            data: None,
        });
        Ok(())
    }

    /// §4.2/§4.8 `Clean`: removes `status` jobs older than `older_than_ms` in
    /// bounded batches, looping until a batch returns fewer than the batch size.
    pub async fn clean(
        &self,
        queue: &str,
        status: TerminalStatus,
        older_than_ms: i64,
    ) -> Result<u64, EngineError> {
        self.require_queue(queue)?;
        let mut total = 0u64;
        loop {
            let removed = self
                .kv
                .clean(queue, status, older_than_ms, self.clean_batch_size)
                .await?;
            total += removed;
            if removed < self.clean_batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }

    /// §4.2/§4.8 `Stats`: O(1) cardinality counts, never a scan.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats, EngineError> {
        self.require_queue(queue)?;
        Ok(self.kv.stats(queue).await?)
    }

    /// §4.8 `Inspect`: paginates a terminal-state sorted set.
    pub async fn inspect(
        &self,
        queue: &str,
        status: TerminalStatus,
        from: u64,
        to: u64,
    ) -> Result<Page, EngineError> {
        self.require_queue(queue)?;
        Ok(self.kv.inspect(queue, status, from, to).await?)
    }

    /// Operator triage convenience (SPEC_FULL §10.6): groups `failed` jobs in
    /// `[from, to)` by `last_error` so an operator can see which error
    /// dominates without reading every record.
    pub async fn failed_reasons(
        &self,
        queue: &str,
        from: u64,
        to: u64,
    ) -> Result<HashMap<String, u64>, EngineError> {
        let page = self.inspect(queue, TerminalStatus::Failed, from, to).await?;
        let mut grouped: HashMap<String, u64> = HashMap::new();
        for job in page.jobs {
            let reason = job.last_error.unwrap_or_else(|| "unknown".to_string());
            *grouped.entry(reason).or_insert(0) += 1;
        }
        Ok(grouped)
    }
}
