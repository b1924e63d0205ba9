//! # Dead letters.
//!
//! A message lands here once its handler rejected it (`Nack`, fatal error) or
//! its attempts ran out. The pump advances past the message only after the
//! sink accepted it; a failing sink is retried with the redelivery backoff.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::DeadLetterError, message::Message};

/// A message the core gave up on.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    /// Durable the message was delivered to.
    pub durable: Arc<str>,
    /// The message as last delivered.
    pub message: Message,
    /// Handler attempts made.
    pub attempts: u32,
    /// Why it was given up.
    pub reason: String,
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Stores `letter`; an error makes the pump retry later.
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Sink that records dead letters through `tracing` at `error` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterSink for LogDeadLetters {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        tracing::error!(
            durable = %letter.durable,
            subject = letter.message.subject(),
            seq = letter.message.seq(),
            attempts = letter.attempts,
            payload_len = letter.message.payload().len(),
            reason = %letter.reason,
            "dead letter"
        );
        Ok(())
    }
}
