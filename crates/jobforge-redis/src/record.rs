//! Job record <-> Redis hash encoding (§6 field names, extended with
//! `backoff_max_ms`/`retain_on_completion`/`retain_on_failure` which the
//! in-process `JobRecord` type carries but the distilled wire layout in §6
//! left as defaulted).

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use jobforge::{BackoffStrategy, JobRecord, JobState};

fn encode_state(s: JobState) -> &'static str {
    s.as_str()
}

fn decode_state(s: &str) -> Result<JobState, String> {
    Ok(match s {
        "waiting" => JobState::Waiting,
        "delayed" => JobState::Delayed,
        "active" => JobState::Active,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "paused" => JobState::Paused,
        other => return Err(format!("unknown job state {other:?}")),
    })
}

fn decode_strategy(s: &str) -> Result<BackoffStrategy, String> {
    Ok(match s {
        "fixed" => BackoffStrategy::Fixed,
        "exponential" => BackoffStrategy::Exponential,
        other => return Err(format!("unknown backoff strategy {other:?}")),
    })
}

/// Flattens `job` into `[field, value, field, value, ...]`, suitable both for
/// a literal `HSET` and as the tail of a script's `ARGV`.
pub fn encode_job(job: &JobRecord) -> Vec<String> {
    let mut out = Vec::with_capacity(44);
    let mut put = |field: &str, value: String| {
        out.push(field.to_string());
        out.push(value);
    };

    put("id", job.id.to_string());
    put("queue", job.queue.clone());
    put("kind", job.kind.clone());
    put("payload_b64", B64.encode(&job.payload));
    put("priority_class", job.priority_class.to_string());
    put("attempts_made", job.attempts_made.to_string());
    put("attempts_max", job.attempts_max.to_string());
    put(
        "backoff_strategy",
        match job.backoff_strategy {
            BackoffStrategy::Fixed => "fixed".into(),
            BackoffStrategy::Exponential => "exponential".into(),
        },
    );
    put("backoff_base_ms", job.backoff_base_ms.to_string());
    put("backoff_max_ms", job.backoff_max_ms.to_string());
    put("timeout_ms", job.timeout_ms.to_string());
    put("state", encode_state(job.state).to_string());
    put("available_at_ms", job.available_at_ms.to_string());
    put(
        "lease_until_ms",
        job.lease_until_ms.map(|v| v.to_string()).unwrap_or_default(),
    );
    put("created_at_ms", job.created_at_ms.to_string());
    put(
        "first_attempted_at_ms",
        job.first_attempted_at_ms
            .map(|v| v.to_string())
            .unwrap_or_default(),
    );
    put(
        "finished_at_ms",
        job.finished_at_ms.map(|v| v.to_string()).unwrap_or_default(),
    );
    put(
        "result_b64",
        job.result.as_ref().map(|r| B64.encode(r)).unwrap_or_default(),
    );
    put("last_error", job.last_error.clone().unwrap_or_default());
    put("stall_count", job.stall_count.to_string());
    put("dedup_key", job.dedup_key.clone().unwrap_or_default());
    put("repeat_id", job.repeat_id.clone().unwrap_or_default());
    put("retain_on_completion", (job.retain_on_completion as u8).to_string());
    put("retain_on_failure", (job.retain_on_failure as u8).to_string());
    out
}

/// Inverse of [`encode_job`], from a flat `[field, value, ...]` slice (the
/// shape both `HGETALL` and a script's table-to-array conversion produce).
pub fn decode_job(flat: &[String]) -> Result<JobRecord, String> {
    decode_job_map(flat)
}

pub fn decode_job_map(flat: &[String]) -> Result<JobRecord, String> {
    let mut map: HashMap<&str, &str> = HashMap::with_capacity(flat.len() / 2);
    let mut it = flat.iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        map.insert(k.as_str(), v.as_str());
    }

    let get = |field: &str| -> Result<&str, String> {
        map.get(field)
            .copied()
            .ok_or_else(|| format!("missing field {field:?}"))
    };
    let parse_i64 = |field: &str| -> Result<i64, String> {
        get(field)?.parse::<i64>().map_err(|e| e.to_string())
    };
    let parse_opt_i64 = |field: &str| -> Result<Option<i64>, String> {
        let raw = get(field)?;
        if raw.is_empty() {
            Ok(None)
        } else {
            raw.parse::<i64>().map(Some).map_err(|e| e.to_string())
        }
    };
    let opt_string = |field: &str| -> Option<String> {
        map.get(field)
            .copied()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(JobRecord {
        id: get("id")?.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
        queue: get("queue")?.to_string(),
        kind: get("kind")?.to_string(),
        payload: B64
            .decode(get("payload_b64")?)
            .map_err(|e| e.to_string())?,
        priority_class: get("priority_class")?.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
        attempts_made: get("attempts_made")?.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
        attempts_max: get("attempts_max")?.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
        backoff_strategy: decode_strategy(get("backoff_strategy")?)?,
        backoff_base_ms: parse_i64("backoff_base_ms")?,
        backoff_max_ms: parse_i64("backoff_max_ms")?,
        timeout_ms: parse_i64("timeout_ms")?,
        state: decode_state(get("state")?)?,
        available_at_ms: parse_i64("available_at_ms")?,
        lease_until_ms: parse_opt_i64("lease_until_ms")?,
        created_at_ms: parse_i64("created_at_ms")?,
        first_attempted_at_ms: parse_opt_i64("first_attempted_at_ms")?,
        finished_at_ms: parse_opt_i64("finished_at_ms")?,
        result: {
            let raw = get("result_b64")?;
            if raw.is_empty() {
                None
            } else {
                Some(B64.decode(raw).map_err(|e| e.to_string())?)
            }
        },
        last_error: opt_string("last_error"),
        stall_count: get("stall_count")?.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
        dedup_key: opt_string("dedup_key"),
        repeat_id: opt_string("repeat_id"),
        retain_on_completion: get("retain_on_completion")? == "1",
        retain_on_failure: get("retain_on_failure")? == "1",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u64) -> JobRecord {
        JobRecord {
            id,
            queue: "emails".into(),
            kind: "welcome".into(),
            payload: vec![1, 2, 3, 0, 255],
            priority_class: 2,
            attempts_made: 1,
            attempts_max: 5,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_ms: 1000,
            backoff_max_ms: 600_000,
            timeout_ms: 30_000,
            state: JobState::Active,
            available_at_ms: 1_700_000_000_000,
            lease_until_ms: Some(1_700_000_030_000),
            created_at_ms: 1_700_000_000_000,
            first_attempted_at_ms: Some(1_700_000_000_500),
            finished_at_ms: None,
            result: None,
            last_error: Some("connection reset".into()),
            stall_count: 0,
            dedup_key: Some("user:42".into()),
            repeat_id: None,
            retain_on_completion: true,
            retain_on_failure: true,
        }
    }

    #[test]
    fn roundtrips_through_flat_encoding() {
        let job = sample(7);
        let flat = encode_job(&job);
        assert_eq!(flat.len() % 2, 0);
        let back = decode_job(&flat).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn roundtrips_a_completed_job_with_result_and_no_lease() {
        let mut job = sample(8);
        job.state = JobState::Completed;
        job.lease_until_ms = None;
        job.finished_at_ms = Some(1_700_000_031_000);
        job.result = Some(b"ok".to_vec());
        job.last_error = None;
        job.dedup_key = None;
        job.repeat_id = Some("daily-report".into());

        let flat = encode_job(&job);
        let back = decode_job(&flat).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn decode_rejects_missing_field() {
        let job = sample(9);
        let mut flat = encode_job(&job);
        let idx = flat.iter().position(|s| s == "kind").unwrap();
        flat.remove(idx + 1);
        flat.remove(idx);
        assert!(decode_job(&flat).is_err());
    }

    #[test]
    fn decode_rejects_unknown_state() {
        let job = sample(10);
        let mut flat = encode_job(&job);
        let idx = flat.iter().position(|s| s == "state").unwrap();
        flat[idx + 1] = "zombie".into();
        assert!(decode_job(&flat).is_err());
    }
}
