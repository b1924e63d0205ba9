//! # SubscriptionRegistry: durable subscriptions that outlive sessions.
//!
//! Owns every [`Subscription`] and the pump attached to it.
//!
//! ## Architecture
//! ```text
//! subscribe(subject, durable, handler)
//!   ├─► validate names, reject duplicate durable
//!   ├─► load position from PositionStore
//!   └─► session live? attach(session)
//!         ├─ conflict / rejected → removed, error to the caller
//!         └─ link failure        → kept, retried by the listener
//!
//! ConnectionManager.sessions() ──► listener ──► restore_all(session)
//!                                     ▲           └─► attach each subscription
//!                                     └── backoff while any stays detached
//! attach(sub, session)
//!   ├─► stop the previous pump (cancel → join)
//!   ├─► session.subscribe(subject, durable, last_acked + 1)
//!   └─► spawn DeliveryPump(child token of the manager)
//! ```
//!
//! ## Rules
//! - Attach operations are serialized, so a subscription is never declared
//!   twice on one session.
//! - A restore failure for one subscription is published and does not stop
//!   the others; the listener tries again with the redelivery backoff until
//!   every subscription is attached to the live session.
//! - `shutdown` cancels every pump and waits up to the grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::{select, time};
use tokio::task::JoinHandle;

use super::{
    bridge::HandlerBridge,
    connection::ConnectionManager,
    pump::DeliveryPump,
    session::Session,
    subscription::{PumpHandle, Subscription, SubscriptionHandle, SubscriptionInfo},
};
use crate::{
    dead_letter::DeadLetterSink,
    error::{RuntimeError, SubscriptionError, TransportError},
    events::{Bus, Event, EventKind},
    policies::RedeliveryPolicy,
    store::PositionStore,
};

/// Registry of durable subscriptions.
pub struct SubscriptionRegistry {
    subs: RwLock<HashMap<u64, Arc<Subscription>>>,
    attach_lock: Mutex<()>,
    pending: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,

    manager: Arc<ConnectionManager>,
    bus: Bus,
    policy: RedeliveryPolicy,
    handler_timeout: Option<Duration>,
    dead_letters: Arc<dyn DeadLetterSink>,
    positions: Arc<dyn PositionStore>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry bound to `manager`.
    pub fn new(
        manager: Arc<ConnectionManager>,
        bus: Bus,
        policy: RedeliveryPolicy,
        handler_timeout: Option<Duration>,
        dead_letters: Arc<dyn DeadLetterSink>,
        positions: Arc<dyn PositionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(HashMap::new()),
            attach_lock: Mutex::new(()),
            pending: Notify::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            manager,
            bus,
            policy,
            handler_timeout,
            dead_letters,
            positions,
        })
    }

    /// Restores all subscriptions on every new session until the manager closes.
    ///
    /// While some subscription is not attached to the live session the
    /// restore is repeated with the redelivery backoff.
    ///
    /// Call once, inside a tokio runtime.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut sessions = self.manager.sessions();
        let token = self.manager.child_token();
        let me = Arc::clone(self);

        tokio::spawn(async move {
            let mut current_id = None;
            let mut retries: u32 = 0;
            loop {
                let current = sessions.borrow_and_update().clone();
                let mut retry_in = None;
                if let Some(session) = current {
                    if current_id != Some(session.id()) {
                        current_id = Some(session.id());
                        retries = 0;
                    }
                    me.restore_all(&session).await;
                    if me.detached(session.id()).await > 0 {
                        retry_in = Some(me.policy.backoff.next(retries));
                        retries = retries.saturating_add(1);
                    }
                }

                let retry = async move {
                    match retry_in {
                        Some(delay) => time::sleep(delay).await,
                        None => std::future::pending().await,
                    }
                };
                select! {
                    _ = token.cancelled() => break,
                    _ = me.pending.notified() => {}
                    _ = retry => {}
                    changed = sessions.changed() => if changed.is_err() { break },
                }
            }
        })
    }

    /// Registers a durable subscription.
    ///
    /// If a session is live the subscription is declared right away; a
    /// conflict or rejection removes it again and is returned. Otherwise, or
    /// when the link fails mid-declare, it stays registered and is attached
    /// by the next restore.
    ///
    /// A bridge that already carries a timeout keeps it; others get the
    /// registry default.
    pub async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        handler: impl Into<HandlerBridge>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        validate("subject", subject)?;
        validate("durable", durable)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(SubscriptionError::Closed);
        }

        let _guard = self.attach_lock.lock().await;

        let sub = {
            let subs = self.subs.read().await;
            if let Some(other) = subs.values().find(|s| s.durable().as_ref() == durable) {
                return Err(SubscriptionError::DurableConflict {
                    durable: durable.to_string(),
                    subject: other.subject().to_string(),
                });
            }
            drop(subs);

            let last_acked = self.positions.load(durable).await;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let bridge: HandlerBridge = handler.into();
            let bridge = match bridge.timeout() {
                Some(_) => bridge,
                None => bridge.with_timeout(self.handler_timeout),
            };
            Arc::new(Subscription::new(id, subject, durable, bridge, last_acked))
        };

        self.subs
            .write()
            .await
            .insert(sub.handle.id(), Arc::clone(&sub));
        self.bus.publish(
            Event::new(EventKind::SubscriptionAdded)
                .with_subject(Arc::clone(sub.subject()))
                .with_durable(Arc::clone(sub.durable()))
                .with_msg_seq(sub.last_acked()),
        );

        if let Some(session) = self.manager.session() {
            if let Err(e) = self.attach(&sub, &session).await {
                if !e.is_transient() {
                    self.subs.write().await.remove(&sub.handle.id());
                    return Err(SubscriptionError::from_transport(
                        sub.subject(),
                        sub.durable(),
                        e,
                    ));
                }
                self.publish_failed(&sub, session.id(), &e);
                self.pending.notify_one();
            }
        }
        Ok(sub.handle.clone())
    }

    /// Re-declares every subscription on `session`, resuming at
    /// `last_acked + 1`. Returns the number attached.
    pub async fn restore_all(&self, session: &Session) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let _guard = self.attach_lock.lock().await;

        let mut subs: Vec<Arc<Subscription>> = self.subs.read().await.values().cloned().collect();
        subs.sort_unstable_by_key(|s| s.handle.id());

        let mut restored = 0;
        for sub in subs {
            if sub.attached_to() == Some(session.id()) {
                restored += 1;
                continue;
            }
            match self.attach(&sub, session).await {
                Ok(()) => restored += 1,
                Err(e) => self.publish_failed(&sub, session.id(), &e),
            }
        }
        restored
    }

    /// Stops the pump, releases the durable binding and forgets the
    /// subscription. Returns the final last-acked sequence.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<u64, SubscriptionError> {
        let _guard = self.attach_lock.lock().await;
        let sub = self
            .subs
            .write()
            .await
            .remove(&handle.id())
            .ok_or_else(|| SubscriptionError::NotFound {
                durable: handle.durable().to_string(),
            })?;

        if let Some(pump) = sub.take_pump() {
            pump.token.cancel();
            let _ = pump.join.await;
        }

        let last_acked = sub.last_acked();
        self.bus.publish(
            Event::new(EventKind::SubscriptionRemoved)
                .with_subject(Arc::clone(sub.subject()))
                .with_durable(Arc::clone(sub.durable()))
                .with_msg_seq(last_acked),
        );
        Ok(last_acked)
    }

    /// Last-acked sequence of a registered subscription.
    pub async fn last_acked(&self, handle: &SubscriptionHandle) -> Option<u64> {
        self.subs
            .read()
            .await
            .get(&handle.id())
            .map(|s| s.last_acked())
    }

    /// Snapshot of all subscriptions, ordered by registration.
    pub async fn list(&self) -> Vec<SubscriptionInfo> {
        let mut out: Vec<SubscriptionInfo> =
            self.subs.read().await.values().map(|s| s.info()).collect();
        out.sort_unstable_by_key(|i| i.handle.id());
        out
    }

    /// Cancels every pump and waits up to `grace` for them to stop.
    ///
    /// Publishes `AllStoppedWithin` or `GraceExceeded`; stuck pumps are
    /// aborted and their durables returned in the error.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), RuntimeError> {
        self.closed.store(true, Ordering::Release);

        let subs: Vec<Arc<Subscription>> = self.subs.read().await.values().cloned().collect();
        let mut pumps: Vec<(String, PumpHandle)> = subs
            .iter()
            .filter_map(|s| s.take_pump().map(|p| (s.durable().to_string(), p)))
            .collect();

        for (_, p) in &pumps {
            p.token.cancel();
        }

        let all = async {
            for (_, p) in pumps.iter_mut() {
                let _ = (&mut p.join).await;
            }
        };
        let timed_out = tokio::time::timeout(grace, all).await.is_err();

        if !timed_out {
            self.bus.publish(Event::new(EventKind::AllStoppedWithin));
            return Ok(());
        }

        let mut stuck = Vec::new();
        for (durable, p) in &pumps {
            if !p.join.is_finished() {
                p.join.abort();
                stuck.push(durable.clone());
            }
        }
        stuck.sort_unstable();
        self.bus
            .publish(Event::new(EventKind::GraceExceeded).with_reason(stuck.join(",")));
        Err(RuntimeError::GraceExceeded { grace, stuck })
    }

    /// Subscriptions not attached to session `session_id`.
    async fn detached(&self, session_id: u64) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.subs
            .read()
            .await
            .values()
            .filter(|s| s.attached_to() != Some(session_id))
            .count()
    }

    fn publish_failed(&self, sub: &Subscription, session_id: u64, err: &TransportError) {
        self.bus.publish(
            Event::new(EventKind::SubscriptionFailed)
                .with_session(session_id)
                .with_subject(Arc::clone(sub.subject()))
                .with_durable(Arc::clone(sub.durable()))
                .with_reason(err.to_string()),
        );
    }

    async fn attach(&self, sub: &Arc<Subscription>, session: &Session) -> Result<(), TransportError> {
        if let Some(old) = sub.take_pump() {
            old.token.cancel();
            let _ = old.join.await;
        }

        let start = sub.last_acked() + 1;
        let stream = session
            .subscribe(sub.subject(), sub.durable(), start)
            .await?;

        let pump = DeliveryPump {
            sub: Arc::clone(sub),
            session: session.clone(),
            policy: self.policy,
            dead_letters: Arc::clone(&self.dead_letters),
            positions: Arc::clone(&self.positions),
            manager: Arc::clone(&self.manager),
            bus: self.bus.clone(),
        };
        let token = self.manager.child_token();
        let join = tokio::spawn(pump.run(stream, token.clone()));
        sub.set_pump(PumpHandle {
            session: session.id(),
            token,
            join,
        });

        self.bus.publish(
            Event::new(EventKind::SubscriptionRestored)
                .with_session(session.id())
                .with_subject(Arc::clone(sub.subject()))
                .with_durable(Arc::clone(sub.durable()))
                .with_msg_seq(start),
        );
        Ok(())
    }
}

fn validate(field: &'static str, value: &str) -> Result<(), SubscriptionError> {
    let bad = value.is_empty()
        || value.len() > 255
        || value.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(SubscriptionError::Invalid {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
