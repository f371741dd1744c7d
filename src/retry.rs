//! Retry bound and the decision taken after a failed attempt.

use serde::{Deserialize, Serialize};

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How many times a failing job is put back on the main queue before it is
/// escalated to the dead-letter queue.
///
/// Retries are not delayed: a retried job goes to the tail of the main queue
/// and waits its turn like any other message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decides what happens to a job whose attempt with `retries` prior
    /// failures has just failed.
    ///
    /// A job that has already been retried `max_retries` times is not
    /// attempted again.
    pub fn decide(&self, retries: u32) -> RetryDecision {
        if retries < self.max_retries {
            RetryDecision::Retry { next_retries: retries + 1 }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish to the main queue with the given retry count.
    Retry { next_retries: u32 },
    /// Publish to the dead-letter queue unchanged.
    DeadLetter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_three_retries() {
        assert_eq!(RetryPolicy::default().max_retries, 3);
    }

    #[test]
    fn test_decide_is_strict_less_than() {
        let policy = RetryPolicy::new(3);

        assert_eq!(policy.decide(0), RetryDecision::Retry { next_retries: 1 });
        assert_eq!(policy.decide(2), RetryDecision::Retry { next_retries: 3 });
        assert_eq!(policy.decide(3), RetryDecision::DeadLetter);
        assert_eq!(policy.decide(10), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_zero_retries_dead_letters_first_failure() {
        assert_eq!(RetryPolicy::new(0).decide(0), RetryDecision::DeadLetter);
    }
}
