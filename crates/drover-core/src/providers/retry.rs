//! Retry helpers shared by the step and compaction paths.
//!
//! Exponential backoff with jitter plus retryable-status classification.
//! Only the classification and the bounded-attempts policy are contractual;
//! the exact curve is tunable.

use std::time::Duration;

use rand::Rng;

const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 30_000;
const MIN_DELAY_MS: u64 = 100;

/// Returns `true` if the HTTP status code is transient and worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503)
}

/// Calculates the exponential backoff delay with random jitter.
///
/// Base delay is 1 second, doubled each attempt, with ±25% jitter and a
/// 30-second cap:
/// - attempt 0: ~1s (0.75s – 1.25s)
/// - attempt 1: ~2s (1.5s – 2.5s)
/// - attempt 2: ~4s (3.0s – 5.0s)
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = BASE_DELAY_MS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_DELAY_MS);
    let jitter_range = base_ms / 4;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    let delay_ms = (base_ms as i64 + jitter).max(MIN_DELAY_MS as i64) as u64;
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));

        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(422));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_backoff_delay_exponential_growth() {
        // Sample repeatedly to cover the jitter range.
        for _ in 0..20 {
            let d0 = backoff_delay(0);
            let d1 = backoff_delay(1);
            let d2 = backoff_delay(2);

            assert!((750..=1250).contains(&(d0.as_millis() as u64)), "{d0:?}");
            assert!((1500..=2500).contains(&(d1.as_millis() as u64)), "{d1:?}");
            assert!((3000..=5000).contains(&(d2.as_millis() as u64)), "{d2:?}");
        }
    }

    #[test]
    fn test_backoff_delay_is_capped_without_overflow() {
        for _ in 0..20 {
            let delay = backoff_delay(40);
            let ms = delay.as_millis() as u64;
            assert!(ms >= MIN_DELAY_MS);
            assert!(ms <= MAX_DELAY_MS + MAX_DELAY_MS / 4);
        }
    }
}
