//! Retry policies for step attempts.

use std::time::Duration;

/// How a failed step attempt is retried.
///
/// `max_retries` counts retries after the initial attempt, so a policy with
/// `max_retries = N` permits N + 1 attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    None,

    /// Wait the same delay before every retry.
    Fixed { max_retries: u32, delay: Duration },

    /// Double the delay on each retry, up to a cap.
    Exponential {
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at 1 second, capped at 5 minutes.
    pub fn exponential(max_retries: u32) -> Self {
        Self::Exponential {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Fixed delay between retries.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// The delay to wait after the given failed attempt (1-indexed), or
    /// `None` once the retry budget is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::Exponential {
                initial_delay,
                max_delay,
                ..
            } => {
                let doublings = attempt.saturating_sub(1).min(31);
                let backoff = initial_delay.saturating_mul(1u32 << doublings);
                Some(backoff.min(*max_delay))
            }
        }
    }

    /// Retries permitted after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::Exponential { max_retries, .. } => *max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_retries() {
        assert_eq!(RetryPolicy::None.max_retries(), 0);
        assert_eq!(RetryPolicy::None.delay_for_attempt(1), None);
    }

    #[test]
    fn fixed_delay_is_constant_until_budget_runs_out() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for_attempt(3), None);
    }

    #[test]
    fn exponential_doubles_each_retry() {
        let policy = RetryPolicy::Exponential {
            max_retries: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_for_attempt(5), None);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::Exponential {
            max_retries: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };

        assert_eq!(policy.delay_for_attempt(6), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for_attempt(20), Some(Duration::from_secs(30)));
    }

    #[test]
    fn default_policy_is_none() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::None);
    }
}
