//! # Message handlers.
//!
//! [`Handler`] is the application seam: it receives one [`Message`] and a
//! cancellation token and decides an [`Outcome`]. [`HandlerFn`] wraps a
//! closure that creates a fresh future per message.
//!
//! ## Contract
//! - Called for at most one message at a time per subscription.
//! - May be called again for the same sequence (retry or redelivery after a
//!   reconnect); check [`Message::attempt`] / [`Message::is_redelivered`].
//! - Should return promptly once `ctx` is cancelled (timeout or shutdown).
//!
//! ## Example
//! ```rust
//! use tokio_util::sync::CancellationToken;
//! use busvisor::{HandlerError, HandlerFn, HandlerRef, Message, Outcome};
//!
//! let h: HandlerRef = HandlerFn::arc(|msg: Message, _ctx: CancellationToken| async move {
//!     if msg.payload().is_empty() {
//!         return Ok(Outcome::Nack);
//!     }
//!     Ok::<_, HandlerError>(Outcome::Ack)
//! });
//! # let _ = h;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::HandlerError,
    message::{Message, Outcome},
};

/// Shared handle to a handler.
pub type HandlerRef = Arc<dyn Handler>;

/// Application logic for one subscription.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Processes one message.
    async fn on_message(&self, msg: Message, ctx: CancellationToken)
    -> Result<Outcome, HandlerError>;
}

/// Closure-backed handler.
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    /// Wraps a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wraps a closure and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    async fn on_message(
        &self,
        msg: Message,
        ctx: CancellationToken,
    ) -> Result<Outcome, HandlerError> {
        (self.f)(msg, ctx).await
    }
}
