//! The Lifecycle Manager (C10, §4.9): initialization, health check, and
//! graceful shutdown across every attached queue. Also the crate's primary
//! entry point (`EngineBuilder` -> `Engine` -> `EngineHandle`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::admin::Admin;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::kv::{Kv, Page, TerminalStatus};
use crate::registry::{Handler, HandlerRegistry, QueueRegistry};
use crate::scheduler::Scheduler;
use crate::stalled::StalledDetector;
use crate::types::{EnqueueOpts, JobRecord, Queue, QueueStats};
use crate::worker::WorkerPool;

/// Everything spawned for one attached queue: its worker pool, promotion
/// ticker, and stalled-job detector ticker.
struct Attached<K: Kv> {
    pool: Arc<WorkerPool<K>>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    promotion_handle: tokio::task::JoinHandle<()>,
    stalled_handle: tokio::task::JoinHandle<()>,
    last_promotion_tick_ms: Arc<AtomicI64>,
}

/// Builds an `Engine`: register queues and handlers, then `build()`.
pub struct EngineBuilder<K: Kv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    registry: QueueRegistry,
    handlers: HandlerRegistry,
}

impl<K: Kv> EngineBuilder<K> {
    pub fn new(kv: Arc<K>) -> Self {
        EngineBuilder {
            kv,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            registry: QueueRegistry::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_queue(mut self, queue: Queue) -> Self {
        self.registry.register(queue);
        self
    }

    pub fn with_handler(self, kind: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.register(kind, handler);
        self
    }

    pub fn build(self) -> Engine<K> {
        Engine {
            kv: self.kv,
            clock: self.clock,
            config: self.config,
            registry: Arc::new(self.registry),
            handlers: self.handlers,
            events: EventBus::new(),
        }
    }
}

/// The assembled engine, not yet running any background tasks. Call
/// `start()` to spin up the Scheduler's promotion loop, Worker Pools, and
/// Stalled-Job Detector for every registered queue (§4.9 `Initialize`).
pub struct Engine<K: Kv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    registry: Arc<QueueRegistry>,
    handlers: HandlerRegistry,
    events: EventBus,
}

impl<K: Kv> Engine<K> {
    /// §4.9 `Initialize`: ping the KV store, then start per-queue tickers and
    /// worker pools. Logs one structured record per queue.
    pub async fn start(self) -> Result<EngineHandle<K>, EngineError> {
        self.kv.ping().await?;

        let scheduler = Arc::new(Scheduler::new(
            self.kv.clone(),
            self.clock.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.config.clone(),
        ));
        let admin = Arc::new(Admin::new(
            self.kv.clone(),
            self.clock.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.config.clean_batch_size,
        ));

        let mut attached = HashMap::new();
        for queue in self.registry.iter() {
            info!(
                queue = %queue.name,
                priority = queue.priority,
                concurrency = queue.concurrency,
                rate_limited = queue.rate_limit.is_some(),
                "starting queue"
            );

            self.kv
                .configure_queue(
                    &queue.name,
                    queue.rate_limit,
                    queue.defaults.keep_completed,
                    queue.defaults.keep_failed,
                )
                .await?;
            scheduler.recover_repeatables(&queue.name).await?;

            let pool = Arc::new(WorkerPool::new(
                queue.name.clone(),
                scheduler.clone(),
                self.handlers.clone(),
                self.clock.clone(),
                self.config.idle_backoff_ms,
                self.config.kv_retry_attempts,
            ));
            let worker_handles = pool.spawn(queue.concurrency);

            let last_tick = Arc::new(AtomicI64::new(self.clock.now_ms()));
            let promotion_handle = spawn_promotion_loop(
                scheduler.clone(),
                self.clock.clone(),
                queue.name.clone(),
                self.config.promotion_interval_ms,
                last_tick.clone(),
            );

            let detector = Arc::new(StalledDetector::new(
                self.kv.clone(),
                self.clock.clone(),
                self.events.clone(),
                self.config.max_stalls,
            ));
            let stalled_handle =
                detector.spawn(queue.name.clone(), self.config.stall_check_interval_ms);

            attached.insert(
                queue.name.clone(),
                Attached {
                    pool,
                    worker_handles,
                    promotion_handle,
                    stalled_handle,
                    last_promotion_tick_ms: last_tick,
                },
            );
        }

        Ok(EngineHandle {
            kv: self.kv,
            clock: self.clock,
            config: self.config,
            registry: self.registry,
            scheduler,
            admin,
            events: self.events,
            attached: Arc::new(attached),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn spawn_promotion_loop<K: Kv>(
    scheduler: Arc<Scheduler<K>>,
    clock: Arc<dyn Clock>,
    queue_name: String,
    interval_ms: i64,
    last_tick: Arc<AtomicI64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1) as u64));
        loop {
            tick.tick().await;
            if let Err(err) = scheduler.promote_due(&queue_name).await {
                tracing::warn!(queue = %queue_name, error = %err, "promotion tick failed");
            }
            last_tick.store(clock.now_ms(), Ordering::Relaxed);
        }
    })
}

/// The live, running engine: the handle producers and admins call (§4.2,
/// §4.8), plus lifecycle operations (§4.9 `HealthCheck`/`Shutdown`).
pub struct EngineHandle<K: Kv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    registry: Arc<QueueRegistry>,
    scheduler: Arc<Scheduler<K>>,
    admin: Arc<Admin<K>>,
    events: EventBus,
    attached: Arc<HashMap<String, Attached<K>>>,
    shutting_down: Arc<AtomicBool>,
}

impl<K: Kv> Clone for EngineHandle<K> {
    fn clone(&self) -> Self {
        EngineHandle {
            kv: self.kv.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            admin: self.admin.clone(),
            events: self.events.clone(),
            attached: self.attached.clone(),
            shutting_down: self.shutting_down.clone(),
        }
    }
}

impl<K: Kv> EngineHandle<K> {
    fn ensure_accepting(&self) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        kind: &str,
        payload: Vec<u8>,
        opts: EnqueueOpts,
    ) -> Result<u64, EngineError> {
        self.ensure_accepting()?;
        let id = self.scheduler.enqueue(queue, kind, payload, opts).await?;
        if let Some(attached) = self.attached.get(queue) {
            attached.pool.notify_waiting();
        }
        Ok(id)
    }

    pub async fn enqueue_scheduled(
        &self,
        queue: &str,
        kind: &str,
        payload: Vec<u8>,
        at_ms: i64,
        opts: EnqueueOpts,
    ) -> Result<u64, EngineError> {
        self.ensure_accepting()?;
        self.scheduler
            .enqueue_scheduled(queue, kind, payload, at_ms, opts)
            .await
    }

    pub async fn enqueue_repeatable(
        &self,
        queue: &str,
        kind: &str,
        payload: Vec<u8>,
        cron: &str,
        timezone: &str,
        opts: EnqueueOpts,
    ) -> Result<String, EngineError> {
        self.ensure_accepting()?;
        self.scheduler
            .enqueue_repeatable(queue, kind, payload, cron, timezone, opts)
            .await
    }

    pub async fn get_job(&self, queue: &str, id: u64) -> Result<JobRecord, EngineError> {
        self.admin.get_job(queue, id).await
    }

    pub async fn remove_job(&self, queue: &str, id: u64) -> Result<(), EngineError> {
        self.admin.remove_job(queue, id).await
    }

    pub async fn retry(&self, queue: &str, id: u64) -> Result<(), EngineError> {
        self.admin.retry(queue, id).await?;
        if let Some(attached) = self.attached.get(queue) {
            attached.pool.notify_waiting();
        }
        Ok(())
    }

    pub async fn pause(&self, queue: &str) -> Result<(), EngineError> {
        self.admin.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> Result<(), EngineError> {
        self.admin.resume(queue).await?;
        if let Some(attached) = self.attached.get(queue) {
            attached.pool.notify_waiting();
        }
        Ok(())
    }

    pub async fn clean(
        &self,
        queue: &str,
        status: TerminalStatus,
        older_than_ms: i64,
    ) -> Result<u64, EngineError> {
        self.admin.clean(queue, status, older_than_ms).await
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, EngineError> {
        self.admin.stats(queue).await
    }

    pub async fn inspect(
        &self,
        queue: &str,
        status: TerminalStatus,
        from: u64,
        to: u64,
    ) -> Result<Page, EngineError> {
        self.admin.inspect(queue, status, from, to).await
    }

    pub async fn failed_reasons(
        &self,
        queue: &str,
        from: u64,
        to: u64,
    ) -> Result<HashMap<String, u64>, EngineError> {
        self.admin.failed_reasons(queue, from, to).await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::types::JobEvent> {
        self.events.subscribe()
    }

    /// §4.9 `HealthCheck`: pings the KV store, verifies every queue's
    /// promotion ticker has advanced within 3x its interval, and verifies
    /// every Worker Pool has at least one worker idle or active.
    pub async fn health_check(&self) -> Result<HealthReport, EngineError> {
        self.kv.ping().await?;
        let now = self.clock.now_ms();
        let mut queues = HashMap::new();
        for (name, attached) in self.attached.iter() {
            let last_tick = attached.last_promotion_tick_ms.load(Ordering::Relaxed);
            let ticker_healthy = now - last_tick <= 3 * self.config.promotion_interval_ms;
            let heartbeat = attached.pool.heartbeat();
            let workers_healthy = heartbeat.idle_count() + heartbeat.active_count() > 0;
            queues.insert(
                name.clone(),
                QueueHealth {
                    ticker_healthy,
                    workers_healthy,
                    idle_workers: heartbeat.idle_count(),
                    active_workers: heartbeat.active_count(),
                },
            );
        }
        Ok(HealthReport { queues })
    }

    /// §4.9 `Shutdown`: stop accepting new jobs, signal workers to finish
    /// in-flight work without popping more, wait up to the configured grace
    /// period, then return — any job still active at that point is left for
    /// the Stalled-Job Detector to reclaim.
    pub async fn shutdown(self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        for attached in self.attached.values() {
            attached.pool.begin_shutdown();
        }

        let grace = Duration::from_millis(self.config.shutdown_grace_period_ms.max(0) as u64);
        let _ = tokio::time::timeout(grace, self.wait_for_workers()).await;

        for attached in self.attached.values() {
            attached.promotion_handle.abort();
            attached.stalled_handle.abort();
            for handle in &attached.worker_handles {
                handle.abort();
            }
        }
    }

    async fn wait_for_workers(&self) {
        loop {
            let all_idle = self
                .attached
                .values()
                .all(|a| a.pool.heartbeat().active_count() == 0);
            if all_idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueHealth {
    pub ticker_healthy: bool,
    pub workers_healthy: bool,
    pub idle_workers: u32,
    pub active_workers: u32,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub queues: HashMap<String, QueueHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.queues
            .values()
            .all(|q| q.ticker_healthy && q.workers_healthy)
    }
}
