//! # LogWriter: runtime events as `tracing` records
//!
//! Connection trouble and dead letters are logged at `warn`/`error`, state
//! changes at `info`, per-message traffic at `debug`/`trace`. Install any
//! `tracing` subscriber (e.g. `tracing_subscriber::fmt`) to see them.

use async_trait::async_trait;
use tracing::{debug, error, info, trace, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Subscriber that forwards events to `tracing`.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Constructs a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let durable = e.durable.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::Connecting => debug!(attempt = ?e.attempt, "connecting"),
            EventKind::Connected => info!(session = ?e.session, "connected"),
            EventKind::Disconnected => warn!(session = ?e.session, reason, "disconnected"),
            EventKind::ConnectFailed => warn!(attempt = ?e.attempt, reason, "connect failed"),
            EventKind::ReconnectScheduled => {
                info!(attempt = ?e.attempt, delay_ms = ?e.delay_ms, "reconnect scheduled")
            }
            EventKind::ReconnectExhausted => {
                error!(attempt = ?e.attempt, reason, "giving up on connection")
            }
            EventKind::Closed => info!(reason, "connection manager closed"),

            EventKind::SubscriptionAdded => {
                info!(subject = ?e.subject, durable, last_acked = ?e.msg_seq, "subscription added")
            }
            EventKind::SubscriptionRestored => {
                info!(session = ?e.session, durable, start_seq = ?e.msg_seq, "subscription attached")
            }
            EventKind::SubscriptionFailed => {
                error!(session = ?e.session, durable, reason, "subscription failed")
            }
            EventKind::SubscriptionRemoved => {
                info!(durable, last_acked = ?e.msg_seq, "subscription removed")
            }
            EventKind::PumpDetached => warn!(durable, reason, "pump lost its stream"),

            EventKind::DeliveryStarting => {
                trace!(durable, seq = ?e.msg_seq, attempt = ?e.attempt, "delivering")
            }
            EventKind::MessageAcked => debug!(durable, seq = ?e.msg_seq, "acked"),
            EventKind::DuplicateSkipped => debug!(durable, seq = ?e.msg_seq, "duplicate skipped"),
            EventKind::HandlerFailed => {
                warn!(durable, seq = ?e.msg_seq, attempt = ?e.attempt, reason, "handler failed")
            }
            EventKind::TimeoutHit => {
                warn!(durable, seq = ?e.msg_seq, timeout_ms = ?e.timeout_ms, "handler timed out")
            }
            EventKind::RedeliveryScheduled => {
                debug!(durable, seq = ?e.msg_seq, attempt = ?e.attempt, delay_ms = ?e.delay_ms, "redelivery scheduled")
            }
            EventKind::DeadLettered => {
                error!(durable, seq = ?e.msg_seq, attempt = ?e.attempt, reason, "dead-lettered")
            }
            EventKind::DeadLetterFailed => {
                error!(durable, seq = ?e.msg_seq, reason, "dead-letter sink failed")
            }
            EventKind::AckFailed => warn!(durable, seq = ?e.msg_seq, reason, "ack failed"),

            EventKind::AllStoppedWithin => info!("all pumps stopped within grace"),
            EventKind::GraceExceeded => error!("shutdown grace exceeded"),
            EventKind::SubscriberOverflow => {
                warn!(subscriber = durable, reason, "subscriber overflow")
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = durable, reason, "subscriber panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
