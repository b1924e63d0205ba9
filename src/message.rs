//! # Messages and handler outcomes.
//!
//! A [`Message`] is created by the transport and never mutated afterwards.
//! The pump derives a copy per attempt with [`Message::with_attempt`]; the
//! payload is shared (`Bytes`), so this is cheap.

use std::sync::Arc;

use bytes::Bytes;

/// One message received from the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    subject: Arc<str>,
    seq: u64,
    payload: Bytes,
    attempt: u32,
    redelivered: bool,
}

impl Message {
    /// Creates a first-delivery message.
    pub fn new(subject: impl Into<Arc<str>>, seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            seq,
            payload: payload.into(),
            attempt: 1,
            redelivered: false,
        }
    }

    /// Marks the message as redelivered by the bus.
    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    /// Copy of this message carrying the given 1-based attempt number.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            redelivered: self.redelivered || attempt > 1,
            ..self.clone()
        }
    }

    /// Subject the message was published on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Sequence number, monotonic per subject.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Delivery attempt (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True if this message was seen before, by the bus or by this core.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }
}

/// What a handler decided about a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Handled; advance the position and acknowledge.
    Ack,
    /// Never processable; dead-letter now without further attempts.
    Nack,
    /// Transient problem; try again per the redelivery policy.
    Retry,
}
