//! Integration tests driving the whole engine (`jobforge-testing::InMemoryKv`
//! stands in for the KV store) plus narrower component tests against
//! `Kv`/`Admin`/`StalledDetector` directly for the scenarios that need a
//! controllable clock rather than real sleeps (§10.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use jobforge_testing::{InMemoryKv, ManualClock};

use crate::async_trait;
use crate::{
    Admin, Backoff, BackoffStrategy, EngineBuilder, EngineConfig, EngineError, EngineHandle,
    EnqueueOpts, EventBus, Handler, HandlerFailure, JobContext, JobRecord, JobState, Kv,
    PopOutcome, Queue, QueueDefaults, QueueRegistry, RateLimit, StalledDetector, StalledOutcome,
    TerminalStatus, DEFAULT_PRIORITY_CLASS,
};

fn test_queue(name: &str) -> Queue {
    Queue {
        name: name.to_string(),
        priority: 0,
        concurrency: 2,
        rate_limit: None,
        defaults: QueueDefaults {
            attempts: 3,
            backoff: Backoff {
                strategy: BackoffStrategy::Exponential,
                base_ms: 20,
                max_ms: 1_000,
            },
            timeout_ms: 500,
            retain_on_completion: true,
            retain_on_failure: true,
            keep_completed: 100,
            keep_failed: 100,
        },
    }
}

/// Tight tickers so scenario tests complete in well under a second instead
/// of waiting out `EngineConfig::default()`'s production-sized intervals.
fn fast_config() -> EngineConfig {
    EngineConfig {
        promotion_interval_ms: 10,
        stall_check_interval_ms: 50,
        idle_backoff_ms: 10,
        lease_buffer_ms: 50,
        shutdown_grace_period_ms: 200,
        ..EngineConfig::default()
    }
}

fn make_job(queue: &str, id: u64, now_ms: i64) -> JobRecord {
    JobRecord {
        id,
        queue: queue.to_string(),
        kind: "test".to_string(),
        payload: Vec::new(),
        priority_class: DEFAULT_PRIORITY_CLASS,
        attempts_made: 0,
        attempts_max: 3,
        backoff_strategy: BackoffStrategy::Fixed,
        backoff_base_ms: 10,
        backoff_max_ms: 1_000,
        timeout_ms: 1_000,
        state: JobState::Waiting,
        available_at_ms: now_ms,
        lease_until_ms: None,
        created_at_ms: now_ms,
        first_attempted_at_ms: None,
        finished_at_ms: None,
        result: None,
        last_error: None,
        stall_count: 0,
        dedup_key: None,
        repeat_id: None,
        retain_on_completion: true,
        retain_on_failure: true,
    }
}

async fn poll_terminal<K: Kv>(
    handle: &EngineHandle<K>,
    queue: &str,
    id: u64,
    timeout: Duration,
) -> JobRecord {
    let start = tokio::time::Instant::now();
    loop {
        let job = handle.get_job(queue, id).await.unwrap();
        if matches!(job.state, JobState::Completed | JobState::Failed) {
            return job;
        }
        if start.elapsed() > timeout {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct AlwaysOk;
#[async_trait]
impl Handler for AlwaysOk {
    async fn handle(&self, _ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        Ok(b"ok".to_vec())
    }
}

struct AlwaysFail;
#[async_trait]
impl Handler for AlwaysFail {
    async fn handle(&self, _ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        Err(HandlerFailure::Retryable("boom".to_string()))
    }
}

struct AlwaysPermanent;
#[async_trait]
impl Handler for AlwaysPermanent {
    async fn handle(&self, _ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        Err(HandlerFailure::Permanent("never again".to_string()))
    }
}

/// Fails its first `remaining` invocations, then succeeds.
struct FailNTimes {
    remaining: Arc<Mutex<u32>>,
}
#[async_trait]
impl Handler for FailNTimes {
    async fn handle(&self, _ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        let mut left = self.remaining.lock().await;
        if *left > 0 {
            *left -= 1;
            Err(HandlerFailure::Retryable("boom".to_string()))
        } else {
            Ok(b"ok".to_vec())
        }
    }
}

struct Recorder(Arc<Mutex<Vec<u64>>>);
#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        self.0.lock().await.push(ctx.job_id);
        Ok(Vec::new())
    }
}

// ---- S1: basic success -----------------------------------------------------

#[tokio::test]
async fn s1_basic_success() {
    let kv = InMemoryKv::new();
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(test_queue("emails"))
        .with_handler("welcome", Arc::new(AlwaysOk))
        .build();
    let handle = engine.start().await.unwrap();

    let id = handle
        .enqueue("emails", "welcome", br#"{"to":"a@x"}"#.to_vec(), EnqueueOpts::default())
        .await
        .unwrap();

    let job = poll_terminal(&handle, "emails", id, Duration::from_secs(2)).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.result.as_deref(), Some(&b"ok"[..]));
    handle.shutdown().await;
}

// ---- S2: retry then success -------------------------------------------------

#[tokio::test]
async fn s2_retry_then_success() {
    let kv = InMemoryKv::new();
    let mut queue = test_queue("emails");
    queue.defaults.attempts = 3;
    let remaining = Arc::new(Mutex::new(2u32));
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(queue)
        .with_handler(
            "welcome",
            Arc::new(FailNTimes {
                remaining: remaining.clone(),
            }),
        )
        .build();
    let handle = engine.start().await.unwrap();

    let id = handle
        .enqueue("emails", "welcome", vec![], EnqueueOpts::default())
        .await
        .unwrap();

    let job = poll_terminal(&handle, "emails", id, Duration::from_secs(3)).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 3);
    handle.shutdown().await;
}

// ---- S3: exhaustion ----------------------------------------------------------

#[tokio::test]
async fn s3_exhaustion() {
    let kv = InMemoryKv::new();
    let mut queue = test_queue("emails");
    queue.defaults.attempts = 3;
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(queue)
        .with_handler("welcome", Arc::new(AlwaysFail))
        .build();
    let handle = engine.start().await.unwrap();

    let id = handle
        .enqueue("emails", "welcome", vec![], EnqueueOpts::default())
        .await
        .unwrap();

    let job = poll_terminal(&handle, "emails", id, Duration::from_secs(3)).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.last_error.as_deref(), Some("boom"));
    handle.shutdown().await;
}

// ---- S6: priority ordering ---------------------------------------------------

#[tokio::test]
async fn s6_priority_ordering() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let kv = InMemoryKv::new();
    let mut queue = test_queue("q");
    queue.concurrency = 1;
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(queue)
        .with_handler("noop", Arc::new(Recorder(recorded.clone())))
        .build();
    let handle = engine.start().await.unwrap();

    // Keep the queue paused while enqueueing so the single worker can't
    // start draining before all three jobs have their final ordering.
    handle.pause("q").await.unwrap();

    let mut opts = EnqueueOpts::default();
    opts.priority_class = Some(2);
    let j1 = handle.enqueue("q", "noop", vec![], opts.clone()).await.unwrap();
    opts.priority_class = Some(1);
    let j2 = handle.enqueue("q", "noop", vec![], opts.clone()).await.unwrap();
    opts.priority_class = Some(2);
    let j3 = handle.enqueue("q", "noop", vec![], opts).await.unwrap();

    handle.resume("q").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if recorded.lock().await.len() == 3 || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(recorded.lock().await.clone(), vec![j2, j1, j3]);
    handle.shutdown().await;
}

// ---- PERMANENT bypasses the retry ladder ------------------------------------

#[tokio::test]
async fn permanent_failure_bypasses_retry_ladder() {
    let kv = InMemoryKv::new();
    let mut queue = test_queue("q");
    queue.defaults.attempts = 5;
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(queue)
        .with_handler("k", Arc::new(AlwaysPermanent))
        .build();
    let handle = engine.start().await.unwrap();

    let id = handle.enqueue("q", "k", vec![], EnqueueOpts::default()).await.unwrap();
    let job = poll_terminal(&handle, "q", id, Duration::from_secs(2)).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 1);
    handle.shutdown().await;
}

// ---- HANDLER_MISSING is terminal ---------------------------------------------

#[tokio::test]
async fn handler_missing_is_terminal() {
    let kv = InMemoryKv::new();
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(test_queue("q"))
        .build();
    let handle = engine.start().await.unwrap();

    let id = handle
        .enqueue("q", "nonexistent_kind", vec![], EnqueueOpts::default())
        .await
        .unwrap();
    let job = poll_terminal(&handle, "q", id, Duration::from_secs(2)).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("HANDLER_MISSING"));
    handle.shutdown().await;
}

// ---- dedup --------------------------------------------------------------------

#[tokio::test]
async fn dedup_rejects_concurrent_duplicate() {
    let kv = InMemoryKv::new();
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(test_queue("q"))
        .with_handler("k", Arc::new(AlwaysOk))
        .build();
    let handle = engine.start().await.unwrap();
    handle.pause("q").await.unwrap();

    let mut opts = EnqueueOpts::default();
    opts.dedup_key = Some("dk1".to_string());
    handle.enqueue("q", "k", vec![], opts.clone()).await.unwrap();
    let second = handle.enqueue("q", "k", vec![], opts).await;
    assert!(matches!(second, Err(EngineError::Duplicate(_))));
    handle.shutdown().await;
}

#[tokio::test]
async fn enqueue_scheduled_rejects_past_time() {
    let kv = InMemoryKv::new();
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(test_queue("q"))
        .with_handler("k", Arc::new(AlwaysOk))
        .build();
    let handle = engine.start().await.unwrap();

    let err = handle
        .enqueue_scheduled("q", "k", vec![], 0, EnqueueOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PastSchedule));
    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_queue_is_rejected() {
    let kv = InMemoryKv::new();
    let engine = EngineBuilder::new(kv).with_config(fast_config()).build();
    let handle = engine.start().await.unwrap();

    let err = handle
        .enqueue("ghost", "k", vec![], EnqueueOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::QueueUnknown(_)));
    handle.shutdown().await;
}

// ---- Admin::retry -------------------------------------------------------------

#[tokio::test]
async fn admin_retry_resets_attempts_and_requeues() {
    let kv = InMemoryKv::new();
    let mut queue = test_queue("q");
    queue.defaults.attempts = 1;
    let remaining = Arc::new(Mutex::new(1u32));
    let engine = EngineBuilder::new(kv)
        .with_config(fast_config())
        .with_queue(queue)
        .with_handler(
            "k",
            Arc::new(FailNTimes {
                remaining: remaining.clone(),
            }),
        )
        .build();
    let handle = engine.start().await.unwrap();

    let id = handle.enqueue("q", "k", vec![], EnqueueOpts::default()).await.unwrap();
    let job = poll_terminal(&handle, "q", id, Duration::from_secs(2)).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 1);

    handle.retry("q", id).await.unwrap();
    let job = poll_terminal(&handle, "q", id, Duration::from_secs(2)).await;
    assert_eq!(job.state, JobState::Completed);
    handle.shutdown().await;
}

// ---- S7: cron, driven end to end through the engine --------------------------

#[tokio::test]
async fn s7_cron_fires_and_expands_to_the_next_occurrence() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let kv = InMemoryKv::new();
    let clock = Arc::new(ManualClock::new(0));
    let mut queue = test_queue("reports");
    queue.defaults.timeout_ms = 500;
    let engine = EngineBuilder::new(kv)
        .with_clock(clock.clone())
        .with_config(fast_config())
        .with_queue(queue)
        .with_handler("generate_report", Arc::new(Recorder(recorded.clone())))
        .build();
    let handle = engine.start().await.unwrap();

    // Every minute, starting from epoch: the first fire is one minute out.
    let repeat_id = handle
        .enqueue_repeatable(
            "reports",
            "generate_report",
            vec![],
            "* * * * *",
            "UTC",
            EnqueueOpts::default(),
        )
        .await
        .unwrap();

    clock.set(60_000);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while recorded.lock().await.len() < 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded.lock().await.len(), 1, "expected exactly one fire at minute 1");

    // A second fire only appears once the clock reaches the next minute
    // boundary; before that, the template has no new concrete job due.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorded.lock().await.len(), 1);

    clock.set(120_000);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while recorded.lock().await.len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded.lock().await.len(), 2, "expected a second fire at minute 2");

    let _ = repeat_id;
    handle.shutdown().await;
}

// ---- S4: rate limit ceiling, driven by a manual clock against Kv directly ----

#[tokio::test]
async fn s4_rate_limit_ceiling() {
    let kv = InMemoryKv::new();
    kv.configure_queue("ai", Some(RateLimit { max: 2, window_ms: 1_000 }), 100, 100)
        .await
        .unwrap();

    let mut now = 0i64;
    for i in 1..=5u64 {
        kv.enqueue(make_job("ai", i, now), now).await.unwrap();
    }

    let mut leased = 0;
    for _ in 0..2 {
        match kv.pop_and_lease("ai", now, 0).await.unwrap() {
            PopOutcome::Leased(_) => leased += 1,
            other => panic!("expected a lease, got {other:?}"),
        }
    }
    assert_eq!(leased, 2);

    match kv.pop_and_lease("ai", now, 0).await.unwrap() {
        PopOutcome::Throttled { retry_after_ms } => assert!(retry_after_ms > 0),
        other => panic!("expected throttled, got {other:?}"),
    }

    // One full window later the bucket refills.
    now += 1_000;
    match kv.pop_and_lease("ai", now, 0).await.unwrap() {
        PopOutcome::Leased(_) => {}
        other => panic!("expected a lease after refill, got {other:?}"),
    }
}

// ---- S5: stalled reclaim, driven by ManualClock instead of real sleeps -------

#[tokio::test]
async fn s5_stalled_detector_reclaims_expired_lease() {
    let kv = InMemoryKv::new();
    kv.configure_queue("docs", None, 100, 100).await.unwrap();

    let mut job = make_job("docs", 1, 0);
    job.timeout_ms = 1_000;
    kv.enqueue(job, 0).await.unwrap();

    let leased = match kv.pop_and_lease("docs", 0, 0).await.unwrap() {
        PopOutcome::Leased(j) => j,
        other => panic!("expected a lease, got {other:?}"),
    };
    let lease_until = leased.lease_until_ms.expect("active job carries a lease");

    let clock = Arc::new(ManualClock::new(lease_until + 1));
    let detector = StalledDetector::new(kv.clone(), clock, EventBus::new(), 1);
    let outcomes = detector.run_once("docs").await.unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        StalledOutcome::Requeued { stall_count: 1, .. }
    ));
    let job = kv.get_job("docs", leased.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.stall_count, 1);
}

#[tokio::test]
async fn stalled_job_exceeding_max_stalls_terminates() {
    let kv = InMemoryKv::new();
    kv.configure_queue("docs", None, 100, 100).await.unwrap();

    let mut job = make_job("docs", 1, 0);
    job.timeout_ms = 100;
    kv.enqueue(job, 0).await.unwrap();
    let leased = match kv.pop_and_lease("docs", 0, 0).await.unwrap() {
        PopOutcome::Leased(j) => j,
        other => panic!("expected a lease, got {other:?}"),
    };
    let lease_until = leased.lease_until_ms.unwrap();

    // max_stalls = 0: the very first expired lease is terminal.
    let clock = Arc::new(ManualClock::new(lease_until + 1));
    let detector = StalledDetector::new(kv.clone(), clock, EventBus::new(), 0);
    let outcomes = detector.run_once("docs").await.unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], StalledOutcome::Terminated { .. }));
    let job = kv.get_job("docs", leased.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
}

// ---- Admin::clean is bounded and removes by age ------------------------------

#[tokio::test]
async fn admin_clean_removes_old_terminal_jobs_in_batches() {
    let kv = InMemoryKv::new();
    kv.configure_queue("q", None, 100, 100).await.unwrap();

    for i in 0..5u64 {
        let job = make_job("q", i + 1, 0);
        kv.enqueue(job, 0).await.unwrap();
        let leased = match kv.pop_and_lease("q", 0, 0).await.unwrap() {
            PopOutcome::Leased(j) => j,
            other => panic!("expected a lease, got {other:?}"),
        };
        kv.complete("q", leased.id, vec![], (i as i64) * 1_000).await.unwrap();
    }

    let mut registry = QueueRegistry::new();
    registry.register(test_queue("q"));
    let admin = Admin::new(
        kv.clone(),
        Arc::new(ManualClock::new(0)),
        Arc::new(registry),
        EventBus::new(),
        2, // small batch size to exercise the looping behavior
    );

    let removed = admin.clean("q", TerminalStatus::Completed, 2_500).await.unwrap();
    assert_eq!(removed, 3); // finished_at_ms 0, 1000, 2000 qualify; 3000, 4000 don't

    let stats = admin.stats("q").await.unwrap();
    assert_eq!(stats.completed, 2);
}
