//! Retry backoff policy for failed deliveries.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// For attempt `n` (1-based, counted after the increment) the delay is drawn
/// uniformly from `[base, min(cap, base * 2^(n-1)))`. Full jitter spreads
/// retries of rows that failed together, so a recovering broker is not hit
/// by a synchronized thundering herd.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the next retry, given the attempt count after the
    /// failure was recorded (so the first failure passes `attempts = 1`).
    pub fn delay(&self, attempts: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;

        // 2^(n-1) saturates well before the cap can matter.
        let exponent = attempts.saturating_sub(1).min(31);
        let upper_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(cap_ms.max(base_ms));

        if upper_ms <= base_ms {
            return Duration::from_millis(base_ms);
        }

        let jittered = rand::thread_rng().gen_range(base_ms..upper_ms);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_uses_base_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_stays_within_window() {
        let policy = BackoffPolicy::default();

        for attempts in 2..=6u32 {
            let upper = Duration::from_secs(1 << (attempts - 1)).min(policy.cap);
            for _ in 0..50 {
                let delay = policy.delay(attempts);
                assert!(delay >= policy.base, "delay below base at {attempts}");
                assert!(delay < upper, "delay {delay:?} beyond window at {attempts}");
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::default();

        // 2^(attempts-1) seconds would be far past five minutes.
        for _ in 0..50 {
            let delay = policy.delay(30);
            assert!(delay >= policy.base);
            assert!(delay < policy.cap);
        }
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay(u32::MAX);
        assert!(delay >= policy.base && delay < policy.cap);
    }

    #[test]
    fn test_degenerate_policy_returns_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(5));
        assert_eq!(policy.delay(7), Duration::from_secs(5));
    }
}
