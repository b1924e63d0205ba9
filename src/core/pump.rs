//! # DeliveryPump: ordered delivery for one subscription on one session.
//!
//! ```text
//! loop {
//!   stream.next()
//!     ├─ Err / end     → PumpDetached, manager.invalidate(session)  → exit
//!     ├─ seq ≤ acked   → DuplicateSkipped, re-ack                  → next
//!     └─ message       → deliver():
//!          loop {
//!            attempts ≥ max → dead_letter()
//!            DeliveryStarting, bridge.dispatch()
//!              ├─ Ack              → save, ack, advance, MessageAcked
//!              ├─ Nack / Fatal     → dead_letter()
//!              └─ Retry / Fail /
//!                 Timeout / Panic  → HandlerFailed
//!                                    RedeliveryScheduled + sleep, or dead_letter()
//!          }
//! }
//!
//! dead_letter():
//!   sink ok  → DeadLettered, save, ack, advance
//!   sink err → DeadLetterFailed + sleep, try again (position held)
//! ```
//!
//! ## Rules
//! - One message in flight; the next is read only after the current one is
//!   acked or dead-lettered.
//! - Attempts are recorded on the subscription, so a message interrupted by
//!   a reconnect resumes its attempt count.
//! - Cancellation stops at any await point and never advances the position.

use std::sync::Arc;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use super::{connection::ConnectionManager, session::Session, subscription::Subscription};
use crate::{
    dead_letter::{DeadLetter, DeadLetterSink},
    error::TransportError,
    events::{Bus, Event, EventKind},
    message::{Message, Outcome},
    policies::RedeliveryPolicy,
    store::PositionStore,
    transport::MessageStream,
};

/// Marker for "the pump token was cancelled".
struct Cancelled;

pub(crate) struct DeliveryPump {
    pub(crate) sub: Arc<Subscription>,
    pub(crate) session: Session,
    pub(crate) policy: RedeliveryPolicy,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) positions: Arc<dyn PositionStore>,
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) bus: Bus,
}

impl DeliveryPump {
    pub(crate) async fn run(self, mut stream: Box<dyn MessageStream>, token: CancellationToken) {
        loop {
            let next = select! {
                biased;
                _ = token.cancelled() => return,
                n = stream.next() => n,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return self.detach(e, &token),
                None => return self.detach(TransportError::Closed, &token),
            };

            if msg.seq() <= self.sub.last_acked() {
                self.bus
                    .publish(self.event(EventKind::DuplicateSkipped).with_msg_seq(msg.seq()));
                self.ack(msg.seq()).await;
                continue;
            }

            if self.deliver(msg, &token).await.is_err() {
                return;
            }
        }
    }

    async fn deliver(&self, msg: Message, token: &CancellationToken) -> Result<(), Cancelled> {
        let seq = msg.seq();
        let max = self.policy.max_attempts.max(1);
        let mut attempt = self.sub.attempts_for(seq);

        loop {
            if attempt >= max {
                let reason = format!("gave up after {attempt} attempts");
                return self.dead_letter(&msg, attempt, reason, token).await;
            }

            attempt += 1;
            self.sub.record_attempt(seq, attempt);
            self.bus.publish(
                self.event(EventKind::DeliveryStarting)
                    .with_msg_seq(seq)
                    .with_attempt(attempt),
            );

            let res = self
                .sub
                .bridge
                .dispatch(msg.with_attempt(attempt), token, &self.bus, self.sub.durable())
                .await;

            let reason = match res {
                Ok(Outcome::Ack) => {
                    self.commit(seq).await;
                    self.bus.publish(
                        self.event(EventKind::MessageAcked)
                            .with_msg_seq(seq)
                            .with_attempt(attempt),
                    );
                    return Ok(());
                }
                Ok(Outcome::Nack) => {
                    let reason = "rejected by handler".to_string();
                    return self.dead_letter(&msg, attempt, reason, token).await;
                }
                Ok(Outcome::Retry) => "handler asked for retry".to_string(),
                Err(_) if token.is_cancelled() => return Err(Cancelled),
                Err(e) if !e.is_retryable() => {
                    self.publish_failed(seq, attempt, &e.as_message());
                    return self.dead_letter(&msg, attempt, e.as_message(), token).await;
                }
                Err(e) => e.as_message(),
            };

            self.publish_failed(seq, attempt, &reason);
            if !self.policy.allows_retry(attempt) {
                let reason = format!("gave up after {attempt} attempts: {reason}");
                return self.dead_letter(&msg, attempt, reason, token).await;
            }

            let delay = self.policy.delay_after(attempt);
            self.bus.publish(
                self.event(EventKind::RedeliveryScheduled)
                    .with_msg_seq(seq)
                    .with_attempt(attempt)
                    .with_delay(delay)
                    .with_reason(reason),
            );
            sleep(delay, token).await?;
        }
    }

    async fn dead_letter(
        &self,
        msg: &Message,
        attempts: u32,
        reason: String,
        token: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let seq = msg.seq();
        let mut failures: u32 = 0;

        loop {
            let letter = DeadLetter {
                durable: Arc::clone(self.sub.durable()),
                message: msg.with_attempt(attempts.max(1)),
                attempts,
                reason: reason.clone(),
            };
            let res = select! {
                biased;
                _ = token.cancelled() => return Err(Cancelled),
                r = self.dead_letters.dead_letter(letter) => r,
            };

            match res {
                Ok(()) => {
                    self.bus.publish(
                        self.event(EventKind::DeadLettered)
                            .with_msg_seq(seq)
                            .with_attempt(attempts)
                            .with_reason(reason),
                    );
                    self.commit(seq).await;
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.policy.backoff.next(failures);
                    failures = failures.saturating_add(1);
                    self.bus.publish(
                        self.event(EventKind::DeadLetterFailed)
                            .with_msg_seq(seq)
                            .with_delay(delay)
                            .with_reason(e.to_string()),
                    );
                    sleep(delay, token).await?;
                }
            }
        }
    }

    /// Persists the position, acknowledges to the bus, then advances.
    ///
    /// The in-memory position never runs ahead of the store or the bus.
    async fn commit(&self, seq: u64) {
        if seq > self.sub.last_acked() {
            self.positions.save(self.sub.durable(), seq).await;
        }
        self.ack(seq).await;
        self.sub.advance(seq);
    }

    async fn ack(&self, seq: u64) {
        if let Err(e) = self
            .session
            .ack(self.sub.subject(), self.sub.durable(), seq)
            .await
        {
            self.bus.publish(
                self.event(EventKind::AckFailed)
                    .with_msg_seq(seq)
                    .with_reason(e.to_string()),
            );
        }
    }

    fn detach(self, err: TransportError, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        self.bus.publish(
            self.event(EventKind::PumpDetached)
                .with_session(self.session.id())
                .with_reason(err.to_string()),
        );
        self.manager.invalidate(self.session.id(), err);
    }

    fn publish_failed(&self, seq: u64, attempt: u32, reason: &str) {
        self.bus.publish(
            self.event(EventKind::HandlerFailed)
                .with_msg_seq(seq)
                .with_attempt(attempt)
                .with_reason(reason),
        );
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind)
            .with_subject(Arc::clone(self.sub.subject()))
            .with_durable(Arc::clone(self.sub.durable()))
    }
}

async fn sleep(delay: std::time::Duration, token: &CancellationToken) -> Result<(), Cancelled> {
    let sleep = time::sleep(delay);
    tokio::pin!(sleep);
    select! {
        _ = &mut sleep => Ok(()),
        _ = token.cancelled() => Err(Cancelled),
    }
}
