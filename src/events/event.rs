//! # Runtime events emitted by the connection manager, registry and pumps.
//!
//! [`EventKind`] groups events into:
//! - **Connection events**: dialing, session up/down, reconnect scheduling, fatal stop
//! - **Subscription events**: added, restored after reconnect, failed, removed, detached
//! - **Delivery events**: per-message attempts, acks, retries, timeouts, dead letters
//! - **Runtime events**: shutdown outcome and subscriber health
//!
//! [`Event`] carries optional metadata set depending on the kind.
//!
//! ## Ordering guarantees
//! Every event gets a process-wide sequence number (`seq`) that increases
//! monotonically. It is unrelated to the bus message sequence (`msg_seq`).
//!
//! ## Example
//! ```rust
//! use busvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::MessageAcked)
//!     .with_durable("orders-worker")
//!     .with_msg_seq(5)
//!     .with_attempt(1);
//!
//! assert_eq!(ev.kind, EventKind::MessageAcked);
//! assert_eq!(ev.durable.as_deref(), Some("orders-worker"));
//! assert_eq!(ev.msg_seq, Some(5));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::core::SessionState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Connection ===
    /// Dialing the endpoint.
    ///
    /// Sets: `attempt` (1-based dial attempt within this connect cycle).
    Connecting,

    /// Session established.
    ///
    /// Sets: `session`, `state = Connected`.
    Connected,

    /// Live session dropped.
    ///
    /// Sets: `session`, `reason`, `state = Disconnected`.
    Disconnected,

    /// A dial attempt failed.
    ///
    /// Sets: `attempt`, `reason`.
    ConnectFailed,

    /// Next dial scheduled.
    ///
    /// Sets: `attempt` (failed attempts so far), `delay_ms`.
    ReconnectScheduled,

    /// Reconnect ceiling reached or credentials rejected; the manager stops.
    ///
    /// Sets: `attempt`, `reason`.
    ReconnectExhausted,

    /// Manager closed (explicitly or after a fatal error).
    ///
    /// Sets: `state = Closed`, `reason` on fatal stop.
    Closed,

    // === Subscriptions ===
    /// Subscription registered.
    ///
    /// Sets: `subject`, `durable`, `msg_seq` (stored last-acked).
    SubscriptionAdded,

    /// Subscription declared on a session; pump started.
    ///
    /// Sets: `session`, `subject`, `durable`, `msg_seq` (start sequence).
    SubscriptionRestored,

    /// Declaring a subscription on a session failed.
    ///
    /// Sets: `session`, `subject`, `durable`, `reason`.
    SubscriptionFailed,

    /// Subscription removed by its owner.
    ///
    /// Sets: `subject`, `durable`, `msg_seq` (final last-acked).
    SubscriptionRemoved,

    /// Pump lost its stream; a reconnect was requested.
    ///
    /// Sets: `session`, `durable`, `reason`.
    PumpDetached,

    // === Delivery ===
    /// Handler attempt starting.
    ///
    /// Sets: `durable`, `msg_seq`, `attempt`.
    DeliveryStarting,

    /// Handler returned `Ack`; position advanced and acknowledged.
    ///
    /// Sets: `durable`, `msg_seq`, `attempt`.
    MessageAcked,

    /// Redelivered message at or below the last-acked position was skipped.
    ///
    /// Sets: `durable`, `msg_seq`.
    DuplicateSkipped,

    /// Handler attempt failed (error, `Retry` or timeout).
    ///
    /// Sets: `durable`, `msg_seq`, `attempt`, `reason`.
    HandlerFailed,

    /// Handler exceeded its deadline (followed by `HandlerFailed`).
    ///
    /// Sets: `durable`, `msg_seq`, `attempt`, `timeout_ms`.
    TimeoutHit,

    /// Next attempt scheduled for the in-flight message.
    ///
    /// Sets: `durable`, `msg_seq`, `attempt`, `delay_ms`, `reason`.
    RedeliveryScheduled,

    /// Message handed to the dead-letter sink; position advanced past it.
    ///
    /// Sets: `durable`, `msg_seq`, `attempt`, `reason`.
    DeadLettered,

    /// Dead-letter sink refused the message; will retry.
    ///
    /// Sets: `durable`, `msg_seq`, `reason`, `delay_ms`.
    DeadLetterFailed,

    /// Acknowledgment to the bus failed (position is kept; duplicate is filtered later).
    ///
    /// Sets: `durable`, `msg_seq`, `reason`.
    AckFailed,

    // === Runtime ===
    /// All pumps stopped within the grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some pumps did not stop in time.
    GraceExceeded,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `durable` (subscriber name), `reason`.
    SubscriberOverflow,

    /// Subscriber panicked while handling an event.
    ///
    /// Sets: `durable` (subscriber name), `reason`.
    SubscriberPanicked,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Process-wide, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Session identity, if applicable.
    pub session: Option<u64>,
    /// Session state after a connection event.
    pub state: Option<SessionState>,
    /// Subject of the subscription.
    pub subject: Option<Arc<str>>,
    /// Durable name (or subscriber name for subscriber events).
    pub durable: Option<Arc<str>>,
    /// Bus message sequence.
    pub msg_seq: Option<u64>,
    /// Attempt count (1-based).
    pub attempt: Option<u32>,
    /// Delay before the next attempt in milliseconds.
    pub delay_ms: Option<u32>,
    /// Timeout in milliseconds.
    pub timeout_ms: Option<u32>,
    /// Human-readable reason.
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates an event of the given kind with the current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            session: None,
            state: None,
            subject: None,
            durable: None,
            msg_seq: None,
            attempt: None,
            delay_ms: None,
            timeout_ms: None,
            reason: None,
        }
    }

    /// Attaches a session identity.
    #[inline]
    pub fn with_session(mut self, id: u64) -> Self {
        self.session = Some(id);
        self
    }

    /// Attaches a session state.
    #[inline]
    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attaches a subject.
    #[inline]
    pub fn with_subject(mut self, subject: impl Into<Arc<str>>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attaches a durable name.
    #[inline]
    pub fn with_durable(mut self, durable: impl Into<Arc<str>>) -> Self {
        self.durable = Some(durable.into());
        self
    }

    /// Attaches a bus message sequence.
    #[inline]
    pub fn with_msg_seq(mut self, seq: u64) -> Self {
        self.msg_seq = Some(seq);
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(clamp_ms(d));
        self
    }

    /// Attaches a timeout (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(clamp_ms(d));
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_durable(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_durable(subscriber)
            .with_reason(info)
    }

    /// True for events describing the health of subscribers themselves.
    #[inline]
    pub fn is_subscriber_event(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

fn clamp_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new(EventKind::Connecting);
        let b = Event::new(EventKind::Connected);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn durations_saturate_to_u32_millis() {
        let ev = Event::new(EventKind::RedeliveryScheduled).with_delay(Duration::from_secs(u64::MAX / 4));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
