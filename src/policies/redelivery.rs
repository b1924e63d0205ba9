//! # Bounded redelivery.
//!
//! A message is offered to its handler at most `max_attempts` times. Between
//! attempts the pump sleeps for `backoff.next(attempt - 1)`. When the limit is
//! reached the message goes to the dead-letter sink.

use std::time::Duration;

use crate::policies::BackoffPolicy;

/// How often, and how far apart, a failing message is retried.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RedeliveryPolicy {
    /// Total handler attempts per message (clamped to at least 1).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RedeliveryPolicy {
    /// Five attempts with the default backoff.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RedeliveryPolicy {
    /// True when another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.next(attempt.saturating_sub(1))
    }
}
