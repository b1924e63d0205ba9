//! # Exponential backoff with a cap.
//!
//! The delay for a zero-based retry index `n` is `initial × multiplier^n`,
//! capped at `cap`, then passed through the configured [`JitterPolicy`].
//! The base is derived from `n` alone, so jitter never compounds across retries.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use busvisor::{BackoffPolicy, JitterPolicy};
//!
//! let reconnect = BackoffPolicy {
//!     initial: Duration::from_millis(250),
//!     cap: Duration::from_secs(5),
//!     multiplier: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(reconnect.next(0), Duration::from_millis(250));
//! assert_eq!(reconnect.next(2), Duration::from_secs(1));
//! assert_eq!(reconnect.next(30), Duration::from_secs(5));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Delay schedule used for reconnects and redeliveries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any computed delay.
    pub cap: Duration,
    /// Growth per retry (`1.0` = constant).
    pub multiplier: f64,
    /// Randomization applied on top of the capped base.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// `initial = 100ms`, `cap = 30s`, `multiplier = 2.0`, equal jitter.
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            cap: delay,
            multiplier: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Computes the delay for retry index `retry` (0 = first retry).
    ///
    /// Non-finite or overflowing bases clamp to [`BackoffPolicy::cap`].
    pub fn next(&self, retry: u32) -> Duration {
        let cap_secs = self.cap.as_secs_f64();
        let exp = retry.min(i32::MAX as u32) as i32;
        let raw = self.initial.as_secs_f64() * self.multiplier.powi(exp);

        let base = if raw.is_finite() && (0.0..=cap_secs).contains(&raw) {
            Duration::from_secs_f64(raw)
        } else {
            self.cap
        };

        match self.jitter {
            JitterPolicy::Decorrelated => {
                self.jitter
                    .apply_decorrelated(self.initial.min(self.cap), base, self.cap)
            }
            other => other.apply(base),
        }
    }
}
