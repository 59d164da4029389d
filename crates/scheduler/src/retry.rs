//! Retry/backoff decisions.
//!
//! [`decide`] is a pure function: the jitter comes from an RNG seeded with the
//! caller's seed and the retry count, so identical inputs give identical
//! verdicts.

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rpa_core_types::ErrorClass;
use serde::{Deserialize, Serialize};

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ms() -> u64 {
    250
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random delay added on top of the backoff
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            jitter_ms: jitter.as_millis() as u64,
        }
    }

    /// `min(base * 2^retry_count, max)`, saturating instead of overflowing.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn jitter(&self, retry_count: u32, seed: u64) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = StdRng::seed_from_u64(seed ^ u64::from(retry_count));
        Duration::from_millis(rng.gen_range(0..=self.jitter_ms))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry {
        /// Retry count after this decision
        retry_count: u32,
        delay: Duration,
        jitter: Duration,
    },
    Terminate,
}

impl RetryVerdict {
    /// Time until the task becomes ready again.
    pub fn total_delay(&self) -> Option<Duration> {
        match self {
            RetryVerdict::Retry { delay, jitter, .. } => Some(*delay + *jitter),
            RetryVerdict::Terminate => None,
        }
    }
}

pub fn decide(
    class: ErrorClass,
    retry_count: u32,
    max_retries: u32,
    policy: &RetryPolicy,
    seed: u64,
) -> RetryVerdict {
    if !class.is_retryable() || retry_count >= max_retries {
        return RetryVerdict::Terminate;
    }
    RetryVerdict::Retry {
        retry_count: retry_count + 1,
        delay: policy.backoff(retry_count),
        jitter: policy.jitter(retry_count, seed),
    }
}

/// Stable per-task seed (FNV-1a over the task id).
pub fn seed_for(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), Duration::from_millis(200))
    }

    #[test]
    fn permanent_errors_never_retry() {
        for count in 0..5 {
            assert_eq!(
                decide(ErrorClass::Permanent, count, 10, &policy(), 7),
                RetryVerdict::Terminate
            );
        }
    }

    #[test]
    fn budget_is_enforced() {
        assert!(matches!(
            decide(ErrorClass::Transient, 1, 2, &policy(), 7),
            RetryVerdict::Retry { retry_count: 2, .. }
        ));
        assert_eq!(decide(ErrorClass::Transient, 2, 2, &policy(), 7), RetryVerdict::Terminate);
        assert_eq!(decide(ErrorClass::Transient, 0, 0, &policy(), 7), RetryVerdict::Terminate);
    }

    #[test]
    fn same_inputs_same_verdict() {
        let policy = policy();
        for seed in [0u64, 1, 42, u64::MAX] {
            for count in 0..4 {
                let first = decide(ErrorClass::Transient, count, 5, &policy, seed);
                let second = decide(ErrorClass::Transient, count, 5, &policy, seed);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let policy = policy();
        let mut previous = Duration::ZERO;
        for count in 0..80 {
            let delay = policy.backoff(count);
            assert!(delay >= previous, "delay shrank at retry {count}");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = policy();
        for seed in 0..200u64 {
            let jitter = policy.jitter(1, seed);
            assert!(jitter <= Duration::from_millis(200));
        }
        let none = RetryPolicy { jitter_ms: 0, ..policy };
        assert_eq!(none.jitter(3, 99), Duration::ZERO);
    }

    #[test]
    fn seeds_are_stable() {
        assert_eq!(seed_for("task-1"), seed_for("task-1"));
        assert_ne!(seed_for("task-1"), seed_for("task-2"));
    }
}
