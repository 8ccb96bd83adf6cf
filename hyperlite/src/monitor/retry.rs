use crate::runtime::options::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry for a single monitor command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn counter(&self) -> RetryCounter {
        RetryCounter {
            failures: 0,
            policy: *self,
        }
    }
}

/// Failure count of one command against its policy.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    failures: u32,
    policy: RetryPolicy,
}

impl RetryCounter {
    /// Record a failed attempt.
    ///
    /// Returns the backoff to wait before the next attempt, or `None` when
    /// the attempts are exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        (self.failures < self.policy.max_attempts).then_some(self.policy.backoff)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_attempts_by_default() {
        let mut counter = RetryPolicy::default().counter();
        assert_eq!(counter.record_failure(), Some(Duration::from_secs(1)));
        assert_eq!(counter.record_failure(), Some(Duration::from_secs(1)));
        assert_eq!(counter.record_failure(), None);
        assert_eq!(counter.failures(), 3);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
        };
        assert_eq!(policy.counter().record_failure(), None);
    }
}
