//! Retry policy with a fixed backoff schedule and bounded random jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-node retry policy.
///
/// The backoff schedule is positional: attempt 1's retry waits
/// `backoff_ms[0]`, attempt 2's waits `backoff_ms[1]`, and attempts past the
/// end of the schedule reuse the last entry. Jitter is added to spread
/// synchronized retries across tenants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum execution attempts before escalation.
    pub max_attempts: u32,

    /// Backoff schedule in milliseconds, one entry per retry.
    pub backoff_ms: Vec<u64>,

    /// Jitter bound as a fraction of the scheduled delay (0.2 = up to +20%).
    pub jitter_frac: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: vec![100, 500, 2_000],
            jitter_frac: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: Vec::new(),
            jitter_frac: 0.0,
        }
    }

    /// Whether another attempt is permitted after `attempts` have run.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based),
    /// including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let jitter_max = (base as f64 * self.jitter_frac) as u64;
        let jitter = if jitter_max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_max)
        };
        Duration::from_millis(base + jitter)
    }

    /// Scheduled delay without jitter, for deterministic inspection.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if self.backoff_ms.is_empty() {
            return 0;
        }
        let idx = (attempt.max(1) as usize - 1).min(self.backoff_ms.len() - 1);
        self.backoff_ms[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms(1), 100);
        assert_eq!(policy.base_delay_ms(2), 500);
        assert_eq!(policy.base_delay_ms(3), 2_000);
    }

    #[test]
    fn test_schedule_saturates_at_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms(7), 2_000);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(2).as_millis() as u64;
            assert!((500..=600).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_allows_retry_bounds() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.allows_retry(1));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }
}
