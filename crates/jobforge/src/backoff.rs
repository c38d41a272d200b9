//! Backoff formulas (§4.3, §8 property 7).

use rand::Rng;

use crate::types::{Backoff, BackoffStrategy};

/// `retry_delay(attempts_made)` for the given backoff config.
///
/// - `fixed`: always `base_ms`.
/// - `exponential`: `min(base_ms * 2^attempts_made + jitter, max_ms)` where
///   `jitter` is uniform in `[0, base_ms * 2^attempts_made * 0.1)`, which
///   keeps the result in `[base * 2^n, base * 2^n * 1.1)` before the cap —
///   exactly the range property 7 tests.
pub fn retry_delay_ms(backoff: &Backoff, attempts_made: u32) -> i64 {
    retry_delay_ms_with_rng(backoff, attempts_made, &mut rand::thread_rng())
}

pub(crate) fn retry_delay_ms_with_rng(
    backoff: &Backoff,
    attempts_made: u32,
    rng: &mut impl Rng,
) -> i64 {
    match backoff.strategy {
        BackoffStrategy::Fixed => backoff.base_ms,
        BackoffStrategy::Exponential => {
            let shift = attempts_made.min(62); // guard against overflow on pathological inputs
            let base = backoff.base_ms.saturating_mul(1i64 << shift);
            let jitter_ceiling = ((base as f64) * 0.1).max(0.0);
            let jitter = if jitter_ceiling > 0.0 {
                rng.gen_range(0.0..jitter_ceiling) as i64
            } else {
                0
            };
            (base.saturating_add(jitter)).min(backoff.max_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn fixed_is_always_base() {
        let b = Backoff {
            strategy: BackoffStrategy::Fixed,
            base_ms: 500,
            max_ms: 10_000,
        };
        for attempt in 0..5 {
            assert_eq!(retry_delay_ms(&b, attempt), 500);
        }
    }

    #[test]
    fn exponential_falls_in_expected_band() {
        let b = Backoff {
            strategy: BackoffStrategy::Exponential,
            base_ms: 100,
            max_ms: 60_000,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8u32 {
            let delay = retry_delay_ms_with_rng(&b, attempt, &mut rng);
            let base = 100i64 * (1i64 << attempt);
            let expected_max = ((base as f64) * 1.1) as i64;
            assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
            assert!(delay < expected_max.max(base + 1), "attempt {attempt}: {delay} >= {expected_max}");
        }
    }

    #[test]
    fn exponential_is_capped() {
        let b = Backoff {
            strategy: BackoffStrategy::Exponential,
            base_ms: 100,
            max_ms: 1_000,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let delay = retry_delay_ms_with_rng(&b, 20, &mut rng);
        assert_eq!(delay, 1_000);
    }
}
