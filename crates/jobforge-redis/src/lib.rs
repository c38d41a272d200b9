//! Redis-protocol implementation of [`jobforge::Kv`].
//!
//! Every operation that touches more than one key is a single `EVALSHA`
//! (see [`scripts`]) so no other client ever observes an intermediate state
//! (§5). The wire layout is a handful of per-queue keys:
//!
//! ```text
//! jq:{q}:id              -- INCR counter, next job id
//! jq:{q}:job:{id}        -- HASH, the job record (§6)
//! jq:{q}:wait            -- ZSET, priority/FIFO ordering (score = JobRecord::wait_score,
//!                            member = zero-padded id so same-score ties still break on id)
//! jq:{q}:delayed         -- ZSET, score = available_at_ms
//! jq:{q}:active          -- ZSET, score = lease_until_ms
//! jq:{q}:completed       -- ZSET, score = finished_at_ms (retention ordering)
//! jq:{q}:failed          -- ZSET, score = finished_at_ms
//! jq:{q}:paused          -- STRING "1" or absent
//! jq:{q}:rl:config       -- HASH {max, window_ms}, absent disables rate limiting
//! jq:{q}:rl:tokens       -- STRING, current token count
//! jq:{q}:rl:reset        -- STRING, ms timestamp the bucket next refills
//! jq:{q}:keep            -- HASH {completed, failed} retention counts
//! jq:{q}:repeat:{rid}    -- STRING, JSON-encoded RepeatableTemplate
//! jq:{q}:repeat:index    -- SET, repeat_ids registered on this queue
//! jq:{q}:dedup:{key}     -- STRING, present while a dedup_key's job is live
//! jq:events              -- PUBSUB channel, JSON-encoded JobEvent (§4.7)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobforge_redis::RedisKv;
//!
//! let kv = RedisKv::connect("redis://127.0.0.1/").await?;
//! let engine = jobforge::EngineBuilder::new(std::sync::Arc::new(kv))
//!     .with_queue(queue)
//!     .with_handler("welcome", handler)
//!     .build();
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::Client;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

use jobforge::{
    EnqueueOutcome, JobEvent, JobRecord, JobState, Kv, KvError, Page, PopOutcome, QueueStats,
    RateLimit, RateLimitOutcome, RepeatableTemplate, StalledOutcome, TerminalStatus,
};

mod keys;
mod record;
mod scripts;

use keys::Keys;

fn map_err(e: redis::RedisError) -> KvError {
    if e.is_io_error() {
        KvError::Connection(e.to_string())
    } else {
        KvError::Script(e.to_string())
    }
}

fn parse_u64(s: &str) -> Result<u64, KvError> {
    s.parse().map_err(|e: std::num::ParseIntError| KvError::Serialization(e.to_string()))
}

/// A Redis-protocol [`Kv`] backend. Cheap to clone: [`ConnectionManager`]
/// multiplexes every call over one managed connection with automatic
/// reconnects, and [`Client`] is itself just connection parameters plus a
/// handle used to open the dedicated pub/sub connection `subscribe_events` needs.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    client: Client,
}

impl RedisKv {
    /// Opens `url` (e.g. `redis://127.0.0.1/`) and establishes the managed
    /// connection every `Kv` call reuses.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(map_err)?;
        let manager = client.get_connection_manager().await.map_err(map_err)?;
        Ok(RedisKv { manager, client })
    }
}

/// Parses a `pop_and_lease` reply: `["EMPTY"]`, `["THROTTLED", retry_after_ms]`,
/// or `["LEASED", field, value, field, value, ...]` (§4.3).
fn parse_pop_reply(reply: Vec<String>) -> Result<PopOutcome, KvError> {
    match reply.first().map(String::as_str) {
        Some("EMPTY") => Ok(PopOutcome::Empty),
        Some("THROTTLED") => {
            let retry_after_ms = reply
                .get(1)
                .ok_or_else(|| KvError::Script("THROTTLED reply missing retry_after_ms".to_string()))?
                .parse::<i64>()
                .map_err(|e| KvError::Serialization(e.to_string()))?;
            Ok(PopOutcome::Throttled { retry_after_ms })
        }
        Some("LEASED") => {
            let job = record::decode_job(&reply[1..]).map_err(KvError::Serialization)?;
            Ok(PopOutcome::Leased(job))
        }
        other => Err(KvError::Script(format!("unexpected pop_and_lease reply head {other:?}"))),
    }
}

/// Parses a `reclaim_stalled` reply: a flat array of `(status, id, stall_count)`
/// triples, `status` one of `"requeued"`/`"terminated"` (§4.6).
fn parse_reclaim_reply(reply: Vec<String>) -> Result<Vec<StalledOutcome>, KvError> {
    let mut out = Vec::with_capacity(reply.len() / 3);
    for chunk in reply.chunks(3) {
        let [status, id, count] = chunk else {
            return Err(KvError::Script("malformed reclaim_stalled reply".to_string()));
        };
        let job_id = parse_u64(id)?;
        match status.as_str() {
            "requeued" => {
                let stall_count = count
                    .parse::<u32>()
                    .map_err(|e| KvError::Serialization(e.to_string()))?;
                out.push(StalledOutcome::Requeued { job_id, stall_count });
            }
            "terminated" => out.push(StalledOutcome::Terminated { job_id }),
            other => return Err(KvError::Script(format!("unknown reclaim_stalled status {other:?}"))),
        }
    }
    Ok(out)
}

#[async_trait]
impl Kv for RedisKv {
    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn configure_queue(
        &self,
        queue: &str,
        rate_limit: Option<RateLimit>,
        keep_completed: u64,
        keep_failed: u64,
    ) -> Result<(), KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        match rate_limit {
            Some(rl) => {
                redis::cmd("HSET")
                    .arg(keys.rate_limit_config())
                    .arg("max")
                    .arg(rl.max)
                    .arg("window_ms")
                    .arg(rl.window_ms)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(map_err)?;
            }
            None => {
                redis::cmd("DEL")
                    .arg(keys.rate_limit_config())
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(map_err)?;
            }
        }
        redis::cmd("HSET")
            .arg(keys.keep())
            .arg("completed")
            .arg(keep_completed)
            .arg("failed")
            .arg(keep_failed)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn next_id(&self, queue: &str) -> Result<u64, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        redis::cmd("INCR")
            .arg(keys.id_counter())
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn enqueue(&self, job: JobRecord, _now_ms: i64) -> Result<EnqueueOutcome, KvError> {
        let keys = Keys::new(&job.queue);
        let (target_key, score, is_wait) = match job.state {
            JobState::Waiting => (
                keys.wait(),
                JobRecord::wait_score(job.priority_class, job.created_at_ms),
                "1",
            ),
            JobState::Delayed => (keys.delayed(), job.available_at_ms as f64, "0"),
            other => unreachable!("enqueue only produces waiting/delayed jobs, got {other:?}"),
        };
        let dedup_redis_key = match &job.dedup_key {
            Some(k) => keys.dedup(k),
            // The script never touches KEYS[1] unless ARGV[2] == "1"; any key works here.
            None => keys.job(job.id),
        };
        let has_dedup = if job.dedup_key.is_some() { "1" } else { "0" };
        let dedup_value = job.dedup_key.clone().unwrap_or_default();
        let fields = record::encode_job(&job);

        let mut conn = self.manager.clone();
        // `is_wait` tells the script whether to zero-pad the id into the wait
        // set's member (so same-score ties break correctly on id) — the
        // delayed set's member stays a plain id since `promote_due` looks
        // jobs up there by id directly.
        let inserted: i64 = scripts::enqueue()
            .key(dedup_redis_key)
            .key(keys.job(job.id))
            .key(target_key)
            .arg(job.id.to_string())
            .arg(has_dedup)
            .arg(dedup_value)
            .arg(score)
            .arg(is_wait)
            .arg(fields)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(if inserted == 1 {
            EnqueueOutcome::Inserted
        } else {
            EnqueueOutcome::Duplicate
        })
    }

    async fn promote_due(&self, queue: &str, now_ms: i64) -> Result<Vec<u64>, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let ids: Vec<String> = scripts::promote_due()
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.job_prefix())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        ids.iter().map(|s| parse_u64(s)).collect()
    }

    async fn pop_and_lease(
        &self,
        queue: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<PopOutcome, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let reply: Vec<String> = scripts::pop_and_lease()
            .key(keys.paused())
            .key(keys.rate_limit_config())
            .key(keys.rl_tokens())
            .key(keys.rl_reset())
            .key(keys.wait())
            .key(keys.active())
            .key(keys.job_prefix())
            .arg(now_ms)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        parse_pop_reply(reply)
    }

    async fn renew_lease(
        &self,
        queue: &str,
        job_id: u64,
        new_lease_until_ms: i64,
    ) -> Result<bool, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let ok: i64 = scripts::renew_lease()
            .key(keys.active())
            .key(keys.job(job_id))
            .arg(job_id.to_string())
            .arg(new_lease_until_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(ok == 1)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: u64,
        result: Vec<u8>,
        now_ms: i64,
    ) -> Result<(), KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        scripts::complete()
            .key(keys.active())
            .key(keys.completed())
            .key(keys.job(job_id))
            .key(keys.job_prefix())
            .key(keys.keep())
            .arg(job_id.to_string())
            .arg(now_ms)
            .arg(B64.encode(&result))
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn fail_retry(
        &self,
        queue: &str,
        job_id: u64,
        now_ms: i64,
        delay_ms: i64,
        last_error: String,
    ) -> Result<(), KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        scripts::fail_retry()
            .key(keys.active())
            .key(keys.delayed())
            .key(keys.job(job_id))
            .arg(job_id.to_string())
            .arg(now_ms)
            .arg(now_ms + delay_ms)
            .arg(last_error)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn fail_terminal(
        &self,
        queue: &str,
        job_id: u64,
        now_ms: i64,
        last_error: String,
    ) -> Result<(), KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        scripts::fail_terminal()
            .key(keys.active())
            .key(keys.failed())
            .key(keys.job(job_id))
            .key(keys.job_prefix())
            .key(keys.keep())
            .arg(job_id.to_string())
            .arg(now_ms)
            .arg(last_error)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn take_token(
        &self,
        queue: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<RateLimitOutcome, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let (ok, retry_after_ms): (i64, i64) = scripts::take_token()
            .key(keys.rl_tokens())
            .key(keys.rl_reset())
            .arg(max)
            .arg(window_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(if ok == 1 {
            RateLimitOutcome::Ok
        } else {
            RateLimitOutcome::Throttled { retry_after_ms }
        })
    }

    async fn reclaim_stalled(
        &self,
        queue: &str,
        now_ms: i64,
        max_stalls: u32,
    ) -> Result<Vec<StalledOutcome>, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let reply: Vec<String> = scripts::reclaim_stalled()
            .key(keys.active())
            .key(keys.wait())
            .key(keys.failed())
            .key(keys.job_prefix())
            .arg(now_ms)
            .arg(max_stalls)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        parse_reclaim_reply(reply)
    }

    async fn get_job(&self, queue: &str, job_id: u64) -> Result<Option<JobRecord>, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let flat: Vec<String> = redis::cmd("HGETALL")
            .arg(keys.job(job_id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if flat.is_empty() {
            return Ok(None);
        }
        record::decode_job_map(&flat).map(Some).map_err(KvError::Serialization)
    }

    async fn remove_job(&self, queue: &str, job_id: u64, now_ms: i64) -> Result<bool, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let removed: i64 = scripts::remove_job()
            .key(keys.active())
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.completed())
            .key(keys.failed())
            .key(keys.job(job_id))
            .arg(job_id.to_string())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed == 1)
    }

    async fn retry_job(&self, queue: &str, job_id: u64, now_ms: i64) -> Result<bool, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let ok: i64 = scripts::retry_job()
            .key(keys.failed())
            .key(keys.wait())
            .key(keys.job(job_id))
            .arg(job_id.to_string())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(ok == 1)
    }

    async fn pause(&self, queue: &str) -> Result<(), KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(keys.paused())
            .arg(1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn resume(&self, queue: &str) -> Result<(), KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(keys.paused())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let v: Option<String> = redis::cmd("GET")
            .arg(keys.paused())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(v.as_deref() == Some("1"))
    }

    async fn clean(
        &self,
        queue: &str,
        status: TerminalStatus,
        older_than_ms: i64,
        batch_size: u32,
    ) -> Result<u64, KvError> {
        let keys = Keys::new(queue);
        let set_key = match status {
            TerminalStatus::Completed => keys.completed(),
            TerminalStatus::Failed => keys.failed(),
        };
        let mut conn = self.manager.clone();
        let removed: i64 = scripts::clean()
            .key(set_key)
            .key(keys.job_prefix())
            .arg(older_than_ms)
            .arg(batch_size)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed as u64)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let (waiting, active, completed, failed, delayed, paused): (
            u64,
            u64,
            u64,
            u64,
            u64,
            Option<String>,
        ) = redis::pipe()
            .atomic()
            .cmd("ZCARD")
            .arg(keys.wait())
            .cmd("ZCARD")
            .arg(keys.active())
            .cmd("ZCARD")
            .arg(keys.completed())
            .cmd("ZCARD")
            .arg(keys.failed())
            .cmd("ZCARD")
            .arg(keys.delayed())
            .cmd("GET")
            .arg(keys.paused())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused: paused.as_deref() == Some("1"),
        })
    }

    async fn inspect(
        &self,
        queue: &str,
        status: TerminalStatus,
        from: u64,
        to: u64,
    ) -> Result<Page, KvError> {
        let keys = Keys::new(queue);
        let set_key = match status {
            TerminalStatus::Completed => keys.completed(),
            TerminalStatus::Failed => keys.failed(),
        };
        let mut conn = self.manager.clone();
        let total: u64 = redis::cmd("ZCARD")
            .arg(&set_key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if from >= to {
            return Ok(Page { jobs: Vec::new(), total });
        }
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(&set_key)
            .arg(from)
            .arg(to.saturating_sub(1))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = parse_u64(&id)?;
            let flat: Vec<String> = redis::cmd("HGETALL")
                .arg(keys.job(job_id))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            if !flat.is_empty() {
                jobs.push(record::decode_job_map(&flat).map_err(KvError::Serialization)?);
            }
        }
        Ok(Page { jobs, total })
    }

    async fn put_repeatable(&self, template: &RepeatableTemplate) -> Result<(), KvError> {
        let keys = Keys::new(&template.queue);
        let json = serde_json::to_string(template).map_err(|e| KvError::Serialization(e.to_string()))?;
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(keys.repeat(&template.repeat_id))
            .arg(json)
            .cmd("SADD")
            .arg(keys.repeat_index())
            .arg(&template.repeat_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn get_repeatable(
        &self,
        queue: &str,
        repeat_id: &str,
    ) -> Result<Option<RepeatableTemplate>, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(keys.repeat(repeat_id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| KvError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn list_repeatables(&self, queue: &str) -> Result<Vec<RepeatableTemplate>, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys.repeat_index())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = redis::cmd("GET")
                .arg(keys.repeat(&id))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            if let Some(json) = raw {
                out.push(serde_json::from_str(&json).map_err(|e| KvError::Serialization(e.to_string()))?);
            }
        }
        Ok(out)
    }

    async fn has_live_concrete(&self, queue: &str, repeat_id: &str) -> Result<bool, KvError> {
        let keys = Keys::new(queue);
        let mut conn = self.manager.clone();
        let found: i64 = scripts::has_live_concrete()
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.active())
            .key(keys.job_prefix())
            .arg(repeat_id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(found == 1)
    }

    async fn publish_event(&self, event: &JobEvent) -> Result<(), KvError> {
        let payload = serde_json::to_string(event).map_err(|e| KvError::Serialization(e.to_string()))?;
        let mut conn = self.manager.clone();
        redis::cmd("PUBLISH")
            .arg(Keys::events_channel())
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    /// Opens a dedicated pub/sub connection (the managed multiplexed
    /// connection can't subscribe) and forwards decoded events into a
    /// channel-backed stream. Best-effort per §4.7: a connection drop or a
    /// malformed payload is logged and skipped, not propagated as an error.
    fn subscribe_events(&self) -> Pin<Box<dyn Stream<Item = JobEvent> + Send>> {
        let client = self.client.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<JobEvent>(1024);
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "failed to open redis pubsub connection for jq:events");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(Keys::events_channel()).await {
                error!(error = %e, "failed to subscribe to jq:events");
                return;
            }
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "dropping unreadable jq:events payload");
                        continue;
                    }
                };
                match serde_json::from_str::<JobEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed jq:events payload"),
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

/// Integration tests against a real server, gated behind `REDIS_URL` so the
/// default test run (no server available) skips them instead of failing.
/// `cargo test -- --ignored` with `REDIS_URL=redis://127.0.0.1/` set runs them.
#[cfg(test)]
mod integration_tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use jobforge::{BackoffStrategy, JobRecord, JobState, Kv, TerminalStatus};

    use super::RedisKv;

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    async fn connect() -> Option<RedisKv> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisKv::connect(&url).await.expect("connect to REDIS_URL"))
    }

    fn job(queue: &str, id: u64, now: i64) -> JobRecord {
        JobRecord {
            id,
            queue: queue.to_string(),
            kind: "noop".into(),
            payload: vec![],
            priority_class: 2,
            attempts_made: 0,
            attempts_max: 3,
            backoff_strategy: BackoffStrategy::Fixed,
            backoff_base_ms: 1000,
            backoff_max_ms: 10_000,
            timeout_ms: 30_000,
            state: JobState::Waiting,
            available_at_ms: now,
            lease_until_ms: None,
            created_at_ms: now,
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

    #[tokio::test]
    #[ignore]
    async fn ping_reaches_a_live_server() {
        let Some(kv) = connect().await else { return };
        kv.ping().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn enqueue_pop_lease_and_complete_round_trip() {
        let Some(kv) = connect().await else { return };
        let queue = format!("it-basic-{}", now_ms());
        kv.configure_queue(&queue, None, 10, 10).await.unwrap();

        let now = now_ms();
        let id = kv.next_id(&queue).await.unwrap();
        let j = job(&queue, id, now);
        assert_eq!(kv.enqueue(j, now).await.unwrap(), jobforge::EnqueueOutcome::Inserted);

        let leased = match kv.pop_and_lease(&queue, now, 5000).await.unwrap() {
            jobforge::PopOutcome::Leased(job) => job,
            other => panic!("expected a leased job, got {other:?}"),
        };
        assert_eq!(leased.id, id);
        assert_eq!(leased.attempts_made, 1);

        kv.complete(&queue, id, b"done".to_vec(), now_ms()).await.unwrap();
        let stored = kv.get_job(&queue, id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.result.as_deref(), Some(&b"done"[..]));
    }

    #[tokio::test]
    #[ignore]
    async fn dedup_key_rejects_a_concurrent_duplicate() {
        let Some(kv) = connect().await else { return };
        let queue = format!("it-dedup-{}", now_ms());
        kv.configure_queue(&queue, None, 10, 10).await.unwrap();
        let now = now_ms();

        let id1 = kv.next_id(&queue).await.unwrap();
        let mut j1 = job(&queue, id1, now);
        j1.dedup_key = Some("same-key".into());
        assert_eq!(kv.enqueue(j1, now).await.unwrap(), jobforge::EnqueueOutcome::Inserted);

        let id2 = kv.next_id(&queue).await.unwrap();
        let mut j2 = job(&queue, id2, now);
        j2.dedup_key = Some("same-key".into());
        assert_eq!(kv.enqueue(j2, now).await.unwrap(), jobforge::EnqueueOutcome::Duplicate);
    }

    #[tokio::test]
    #[ignore]
    async fn rate_limit_throttles_past_the_bucket_ceiling() {
        let Some(kv) = connect().await else { return };
        let queue = format!("it-rl-{}", now_ms());
        let now = now_ms();

        let ok = kv.take_token(&queue, 1, 60_000, now).await.unwrap();
        assert_eq!(ok, jobforge::RateLimitOutcome::Ok);
        let throttled = kv.take_token(&queue, 1, 60_000, now).await.unwrap();
        assert!(matches!(throttled, jobforge::RateLimitOutcome::Throttled { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn reclaim_stalled_requeues_an_expired_lease() {
        let Some(kv) = connect().await else { return };
        let queue = format!("it-stall-{}", now_ms());
        kv.configure_queue(&queue, None, 10, 10).await.unwrap();
        let now = now_ms();

        let id = kv.next_id(&queue).await.unwrap();
        kv.enqueue(job(&queue, id, now), now).await.unwrap();
        kv.pop_and_lease(&queue, now, 1).await.unwrap();

        let later = now + 1000;
        let outcomes = kv.reclaim_stalled(&queue, later, 3).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], jobforge::StalledOutcome::Requeued { job_id, .. } if job_id == id));
    }

    #[tokio::test]
    #[ignore]
    async fn clean_removes_old_terminal_jobs_in_bounded_batches() {
        let Some(kv) = connect().await else { return };
        let queue = format!("it-clean-{}", now_ms());
        kv.configure_queue(&queue, None, 0, 0).await.unwrap();
        let now = now_ms();

        for _ in 0..3 {
            let id = kv.next_id(&queue).await.unwrap();
            kv.enqueue(job(&queue, id, now), now).await.unwrap();
            kv.pop_and_lease(&queue, now, 5000).await.unwrap();
            kv.complete(&queue, id, vec![], now).await.unwrap();
        }

        let removed = kv
            .clean(&queue, TerminalStatus::Completed, now + 1, 2)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let removed = kv
            .clean(&queue, TerminalStatus::Completed, now + 1, 2)
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
