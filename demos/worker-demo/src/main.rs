//! Registers handlers for the `emails` and `reports` queues and runs a
//! worker pool against them until interrupted. Pair with
//! `jobforge-producer-demo` pointed at the same `REDIS_URL` to see jobs flow
//! end to end.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobforge::{EngineBuilder, HandlerFailure, JobContext, Queue, RateLimit};
use jobforge_redis::RedisKv;
use tracing::info;

// ============================================================================
// Handlers
// ============================================================================

struct WelcomeEmailHandler;

#[async_trait]
impl jobforge::Handler for WelcomeEmailHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        let payload: serde_json::Value = serde_json::from_slice(&ctx.payload)
            .map_err(|e| HandlerFailure::Permanent(format!("bad payload: {e}")))?;
        info!(job_id = ctx.job_id, to = %payload["to"], "sending welcome email");
        Ok(b"sent".to_vec())
    }
}

struct WeeklyDigestHandler;

#[async_trait]
impl jobforge::Handler for WeeklyDigestHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        info!(job_id = ctx.job_id, attempt = ctx.attempt, "sending weekly digest");
        Ok(b"sent".to_vec())
    }
}

struct GenerateReportHandler;

#[async_trait]
impl jobforge::Handler for GenerateReportHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerFailure> {
        let payload: serde_json::Value = serde_json::from_slice(&ctx.payload)
            .map_err(|e| HandlerFailure::Permanent(format!("bad payload: {e}")))?;
        info!(job_id = ctx.job_id, report = %payload["report"], "generating report");
        if ctx.cancel.is_cancelled() {
            return Err(HandlerFailure::Retryable("cancelled before finishing".into()));
        }
        Ok(b"report generated".to_vec())
    }
}

// ============================================================================
// Queue profiles (must match the producer's; queue config is read-only
// after `Engine::start`, so both processes agree on it out of band)
// ============================================================================

fn emails_queue() -> Queue {
    let mut q = Queue::new("emails");
    q.concurrency = 10;
    q.rate_limit = Some(RateLimit { max: 100, window_ms: 60_000 });
    q.defaults.attempts = 5;
    q
}

fn reports_queue() -> Queue {
    let mut q = Queue::new("reports");
    q.concurrency = 2;
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
        .with_handler("welcome", Arc::new(WelcomeEmailHandler))
        .with_handler("weekly_digest", Arc::new(WeeklyDigestHandler))
        .with_handler("generate_report", Arc::new(GenerateReportHandler))
        .build();

    let handle = engine.start().await.context("starting engine")?;
    println!("worker pool running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    println!("shutting down...");
    handle.shutdown().await;
    println!("shutdown complete");

    Ok(())
}
