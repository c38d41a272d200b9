//! Enqueues work against a running jobforge deployment: an immediate job, a
//! scheduled one, and a recurring report on a cron schedule. Run alongside
//! `jobforge-worker-demo` pointed at the same `REDIS_URL` to see them picked up.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use jobforge::{Backoff, BackoffStrategy, EngineBuilder, EnqueueOpts, Queue, RateLimit};
use jobforge_redis::RedisKv;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

// ============================================================================
// Queue profiles (matching the example defaults operators tend to reach for)
// ============================================================================

fn emails_queue() -> Queue {
    let mut q = Queue::new("emails");
    q.concurrency = 0; // this process only produces; workers run in jobforge-worker-demo
    q.rate_limit = Some(RateLimit { max: 100, window_ms: 60_000 });
    q.defaults.attempts = 5;
    q.defaults.backoff = Backoff {
        strategy: BackoffStrategy::Exponential,
        base_ms: 60_000,
        max_ms: 10 * 60_000,
    };
    q.defaults.timeout_ms = 30_000;
    q
}

fn reports_queue() -> Queue {
    let mut q = Queue::new("reports");
    q.concurrency = 0;
    q.defaults.attempts = 3;
    q.defaults.timeout_ms = 300_000;
    q
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
    let kv = RedisKv::connect(&redis_url)
        .await
        .with_context(|| format!("connecting to {redis_url}"))?;

    let engine = EngineBuilder::new(Arc::new(kv))
        .with_queue(emails_queue())
        .with_queue(reports_queue())
        .build();

    let handle = engine.start().await.context("starting engine")?;

    let welcome_payload = serde_json::to_vec(&serde_json::json!({ "to": "new-user@example.com" }))?;
    let id = handle
        .enqueue("emails", "welcome", welcome_payload, EnqueueOpts::default())
        .await?;
    println!("enqueued welcome email as job {id}");

    let digest_payload = serde_json::to_vec(&serde_json::json!({ "to": "new-user@example.com" }))?;
    let send_at = now_ms() + 60_000;
    let id = handle
        .enqueue_scheduled("emails", "weekly_digest", digest_payload, send_at, EnqueueOpts::default())
        .await?;
    println!("scheduled weekly digest as job {id}, due in 60s");

    let report_payload = serde_json::to_vec(&serde_json::json!({ "report": "daily_active_users" }))?;
    let repeat_id = handle
        .enqueue_repeatable(
            "reports",
            "generate_report",
            report_payload,
            "0 9 * * *",
            "America/New_York",
            EnqueueOpts::default(),
        )
        .await?;
    println!("registered recurring report {repeat_id}, firing daily at 09:00 America/New_York");

    handle.shutdown().await;
    Ok(())
}
