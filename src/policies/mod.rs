//! Delay and retry policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how delays grow between reconnect attempts and between
//!   delivery attempts (initial / multiplier / cap + jitter)
//! - [`JitterPolicy`] randomization strategy so many clients do not reconnect in lockstep
//! - [`RedeliveryPolicy`] how many times a message is offered to its handler
//!   before it goes to the dead-letter sink
//!
//! ## Wiring
//! ```text
//! Config { reconnect: BackoffPolicy, reconnect_ceiling, redelivery: BackoffPolicy, max_attempts }
//!      ├─► ConnectionManager: reconnect.next(failed_attempts) between dials
//!      └─► DeliveryPump:      RedeliveryPolicy { max_attempts, backoff: redelivery }
//! ```

mod backoff;
mod jitter;
mod redelivery;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use redelivery::RedeliveryPolicy;
