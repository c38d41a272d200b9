//! The Stalled-Job Detector (C7, §4.6): periodically reclaims `active` jobs
//! whose lease expired.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::clock::Clock;
use crate::events::EventBus;
use crate::kv::{Kv, StalledOutcome};
use crate::types::{JobEvent, JobEventKind};

pub struct StalledDetector<K: Kv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    max_stalls: u32,
}

impl<K: Kv> StalledDetector<K> {
    pub fn new(kv: Arc<K>, clock: Arc<dyn Clock>, events: EventBus, max_stalls: u32) -> Self {
        StalledDetector {
            kv,
            clock,
            events,
            max_stalls,
        }
    }

    /// One detector cycle for `queue_name` (§4.6 steps 1-4). Multiple
    /// processes may race on the same job; `Kv::reclaim_stalled` performs the
    /// atomic verify-and-move so only one succeeds per job.
    pub async fn run_once(&self, queue_name: &str) -> Result<Vec<StalledOutcome>, crate::error::KvError> {
        let now = self.clock.now_ms();
        let outcomes = self.kv.reclaim_stalled(queue_name, now, self.max_stalls).await?;
        for outcome in &outcomes {
            match outcome {
                StalledOutcome::Requeued { job_id, stall_count } => {
                    warn!(queue = queue_name, job_id, stall_count, "job stalled, requeued");
                    self.events.emit(JobEvent {
                        queue: queue_name.to_string(),
                        job_id: *job_id,
                        kind: JobEventKind::Stalled,
                        at_ms: now,
                        data: None,
                    });
                }
                StalledOutcome::Terminated { job_id } => {
                    warn!(queue = queue_name, job_id, "job exceeded max_stalls, terminated");
                    self.events.emit(JobEvent {
                        queue: queue_name.to_string(),
                        job_id: *job_id,
                        kind: JobEventKind::Failed,
                        at_ms: now,
                        data: Some("STALLED".to_string()),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Spawns the per-queue ticker (§2 C7: "runs as a background task per process").
    pub fn spawn(self: Arc<Self>, queue_name: String, interval_ms: i64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1) as u64));
            loop {
                tick.tick().await;
                if let Err(err) = self.run_once(&queue_name).await {
                    warn!(queue = %queue_name, error = %err, "stalled-job scan failed");
                }
            }
        })
    }
}
