//! Retry decisions for failed extraction attempts.
//!
//! The policy is a pure function of the attempt number and the failure
//! class, so it can be shared freely between workers.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, overload, breaker rejections. Worth another try.
    Transient,
    /// Corrupt or unsupported input. Retrying cannot help.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    /// Decide what to do after attempt number `attempt_count` (1-indexed) failed.
    ///
    /// Attempt `k` is followed by a delay of `base * 2^(k-1)` while
    /// `k <= max_retries`; later failures and every permanent failure give up.
    pub fn decide(&self, attempt_count: u32, class: FailureClass) -> RetryDecision {
        if class == FailureClass::Permanent {
            return RetryDecision::GiveUp;
        }

        let attempt = attempt_count.max(1);
        if attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry(self.delay_for(attempt))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_back_off_exponentially() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let table = [
            (1, RetryDecision::Retry(Duration::from_secs(1))),
            (2, RetryDecision::Retry(Duration::from_secs(2))),
            (3, RetryDecision::Retry(Duration::from_secs(4))),
            (4, RetryDecision::GiveUp),
            (10, RetryDecision::GiveUp),
        ];

        for (attempt, expected) in table {
            assert_eq!(
                policy.decide(attempt, FailureClass::Transient),
                expected,
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn permanent_failures_never_retry() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            assert_eq!(
                policy.decide(attempt, FailureClass::Permanent),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn base_delay_is_configurable() {
        let policy = RetryPolicy::new(2, Duration::from_millis(250));
        assert_eq!(
            policy.decide(2, FailureClass::Transient),
            RetryDecision::Retry(Duration::from_millis(500))
        );
        assert_eq!(
            policy.decide(3, FailureClass::Transient),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn zero_retries_gives_up_immediately() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(
            policy.decide(1, FailureClass::Transient),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1));
        assert!(matches!(
            policy.decide(200, FailureClass::Transient),
            RetryDecision::Retry(_)
        ));
    }
}
