//! Cron expansion for repeatable templates (§4.2 `EnqueueRepeatable`, §4.3
//! "Repeatable expansion", §6 "Cron expressions", §8 property 9 / scenario S7).

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::EngineError;

/// Parses a standard 5-field cron expression (`min hour day month dow`) by
/// prepending a zero seconds field for the `cron` crate, which expects 6 or 7
/// fields. This is purely a parser adaptation: fire times still land on
/// whole minutes exactly as a 5-field crontab would produce.
pub fn parse_schedule(expr: &str) -> Result<Schedule, EngineError> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::Permanent(format!("invalid cron expression {expr:?}: {e}")))
}

pub fn parse_timezone(tz: &str) -> Result<Tz, EngineError> {
    Tz::from_str(tz).map_err(|_| EngineError::Permanent(format!("unknown timezone {tz:?}")))
}

/// The next fire time strictly after `after_ms`, evaluated in `tz`, returned
/// as a UTC instant in milliseconds.
///
/// DST handling is delegated entirely to `cron`/`chrono-tz`'s local-time
/// arithmetic: a fire that falls in a skipped hour (spring-forward) never
/// materializes as a local wall-clock instant and is skipped; a fire that
/// falls in a repeated hour (fall-back) is produced once, at its first
/// occurrence, because `chrono`'s `LocalResult::Ambiguous` resolution used by
/// `cron`'s iterator picks the earliest candidate.
pub fn next_fire_after(schedule: &Schedule, tz: Tz, after_ms: i64) -> Option<i64> {
    let after_utc = Utc.timestamp_millis_opt(after_ms).single()?;
    let after_local = after_utc.with_timezone(&tz);
    schedule
        .after(&after_local)
        .next()
        .map(|dt: DateTime<Tz>| dt.with_timezone(&Utc).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_daily_at_nine() {
        let schedule = parse_schedule("0 9 * * *").unwrap();
        let tz = parse_timezone("America/New_York").unwrap();
        // 2024-01-10 00:00:00 UTC
        let start = 1_704_844_800_000i64;
        let first = next_fire_after(&schedule, tz, start).expect("a fire exists");
        let second = next_fire_after(&schedule, tz, first).expect("a fire exists");
        // Outside DST transitions, successive 09:00-local fires are 24h apart.
        assert_eq!(second - first, 24 * 60 * 60 * 1000);
    }

    #[test]
    fn rejects_garbage_expressions() {
        assert!(parse_schedule("not a cron expr").is_err());
    }
}
