//! # HandlerBridge: one guarded handler invocation.
//!
//! ```text
//! dispatch(msg, parent)
//!   child = parent.child_token()
//!   select {
//!     parent.cancelled()        → child.cancel(), Err(Canceled)
//!     timeout(handler(msg, child))
//!        ├─ Ok(outcome)         → Ok(outcome)
//!        ├─ Err(e)              → Err(e)
//!        ├─ panic               → Err(Panicked)
//!        └─ elapsed             → child.cancel(), TimeoutHit, Err(Timeout)
//!   }
//! ```
//!
//! The bridge never retries; the pump decides what an error means.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::{
    error::HandlerError,
    events::{Bus, Event, EventKind},
    handler::{HandlerFn, HandlerRef},
    message::{Message, Outcome},
    subscribers::panic_message,
};

/// Wraps a handler with a deadline, panic isolation and cancellation.
#[derive(Clone)]
pub struct HandlerBridge {
    handler: HandlerRef,
    timeout: Option<Duration>,
}

impl HandlerBridge {
    /// Bridge without a deadline.
    pub fn new(handler: HandlerRef) -> Self {
        Self {
            handler,
            timeout: None,
        }
    }

    /// Bridge around a closure.
    pub fn register<F, Fut>(on_message: F) -> Self
    where
        F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
    {
        Self::new(HandlerFn::arc(on_message))
    }

    /// Sets the per-invocation deadline (`None` or zero = unbounded).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|d| !d.is_zero());
        self
    }

    /// Per-invocation deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Runs the handler once for `msg`.
    pub async fn dispatch(
        &self,
        msg: Message,
        parent: &CancellationToken,
        bus: &Bus,
        durable: &str,
    ) -> Result<Outcome, HandlerError> {
        let child = parent.child_token();
        let seq = msg.seq();
        let attempt = msg.attempt();

        let call = AssertUnwindSafe(self.handler.on_message(msg, child.clone()))
            .catch_unwind()
            .map(|r| {
                r.unwrap_or_else(|panic| {
                    Err(HandlerError::Panicked {
                        info: panic_message(panic.as_ref()),
                    })
                })
            });

        let guarded = async {
            match self.timeout {
                Some(limit) => match time::timeout(limit, call).await {
                    Ok(r) => r,
                    Err(_elapsed) => {
                        child.cancel();
                        bus.publish(
                            Event::new(EventKind::TimeoutHit)
                                .with_durable(durable)
                                .with_msg_seq(seq)
                                .with_attempt(attempt)
                                .with_timeout(limit),
                        );
                        Err(HandlerError::Timeout { timeout: limit })
                    }
                },
                None => call.await,
            }
        };

        select! {
            biased;
            _ = parent.cancelled() => {
                child.cancel();
                Err(HandlerError::Canceled)
            }
            r = guarded => r,
        }
    }
}

impl From<HandlerRef> for HandlerBridge {
    fn from(handler: HandlerRef) -> Self {
        Self::new(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("orders", 1, "x")
    }

    #[tokio::test]
    async fn returns_handler_outcome() {
        let bridge = HandlerBridge::register(|m: Message, _ctx| async move {
            assert_eq!(m.seq(), 1);
            Ok::<_, HandlerError>(Outcome::Ack)
        });
        let out = bridge
            .dispatch(msg(), &CancellationToken::new(), &Bus::new(8), "w")
            .await;
        assert_eq!(out, Ok(Outcome::Ack));
    }

    #[tokio::test]
    async fn panic_becomes_error() {
        let bridge = HandlerBridge::register(|m: Message, _ctx| async move {
            if m.seq() == 1 {
                panic!("bad payload");
            }
            Ok::<_, HandlerError>(Outcome::Ack)
        });
        let out = bridge
            .dispatch(msg(), &CancellationToken::new(), &Bus::new(8), "w")
            .await;
        assert_eq!(
            out,
            Err(HandlerError::Panicked {
                info: "bad payload".into()
            })
        );
    }

    #[tokio::test]
    async fn timeout_cancels_child_and_publishes() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let bridge = HandlerBridge::register(|_m: Message, ctx: CancellationToken| async move {
            ctx.cancelled().await;
            Ok::<_, HandlerError>(Outcome::Ack)
        })
        .with_timeout(Some(Duration::from_millis(20)));

        let out = bridge
            .dispatch(msg(), &CancellationToken::new(), &bus, "w")
            .await;
        assert_eq!(
            out,
            Err(HandlerError::Timeout {
                timeout: Duration::from_millis(20)
            })
        );
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::TimeoutHit);
        assert_eq!(ev.timeout_ms, Some(20));
    }

    #[tokio::test]
    async fn parent_cancellation_wins() {
        let parent = CancellationToken::new();
        let bridge = HandlerBridge::register(|_m: Message, _ctx| async move {
            time::sleep(Duration::from_secs(60)).await;
            Ok::<_, HandlerError>(Outcome::Ack)
        });
        let cancel = parent.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let out = bridge.dispatch(msg(), &parent, &Bus::new(8), "w").await;
        assert_eq!(out, Err(HandlerError::Canceled));
    }
}
