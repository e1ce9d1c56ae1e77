//! Bounded retry with an explicit backoff ladder.
//!
//! Publishes to the device bus are retried a fixed number of times with
//! increasing delays. The ladder is explicit rather than multiplier-based
//! so the worst-case blocking time of a dispatch is easy to read off the
//! configuration: with the defaults (3 retries, 500/1000/2000 ms) a publish
//! that never succeeds occupies its caller for ~3.5s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transport-level publish failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Backoff delays in milliseconds, indexed by retry number. The last
    /// entry is reused for any retry beyond the ladder.
    pub delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays_ms: vec![500, 1000, 2000],
        }
    }
}

impl RetryPolicy {
    /// Create a policy with an explicit budget and ladder.
    pub fn new(max_retries: u32, delays_ms: Vec<u64>) -> Self {
        Self {
            max_retries,
            delays_ms,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delays_ms: Vec::new(),
        }
    }

    /// Total number of attempts (initial + retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay to wait before retry number `retry` (0-based).
    ///
    /// Returns `None` when the policy has no delays configured.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        if self.delays_ms.is_empty() {
            return None;
        }
        let idx = (retry as usize).min(self.delays_ms.len() - 1);
        Some(Duration::from_millis(self.delays_ms[idx]))
    }

    /// Worst-case total time spent sleeping if every attempt fails.
    pub fn worst_case_wait(&self) -> Duration {
        let mut total = 0u64;
        for retry in 0..self.max_retries {
            if let Some(d) = self.delay_for_retry(retry) {
                total += d.as_millis() as u64;
            }
        }
        Duration::from_millis(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for_retry(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for_retry(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for_retry(2), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_last_delay_reused() {
        let policy = RetryPolicy::new(5, vec![100, 200]);
        assert_eq!(policy.delay_for_retry(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_retry(4), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for_retry(0), None);
        assert_eq!(policy.worst_case_wait(), Duration::ZERO);
    }

    #[test]
    fn test_worst_case_wait() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.worst_case_wait(), Duration::from_millis(3500));

        let policy = RetryPolicy::new(4, vec![100, 200]);
        // 100 + 200 + 200 + 200
        assert_eq!(policy.worst_case_wait(), Duration::from_millis(700));
    }
}
