//! # Subscription state shared by the registry and its pump.
//!
//! The position is the only mutable delivery state: the last-acked sequence
//! and the attempt record of the message in flight. Both survive reconnects
//! because they live here, not in the pump.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bridge::HandlerBridge;

/// Caller-side identity of a registered subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    subject: Arc<str>,
    durable: Arc<str>,
}

impl SubscriptionHandle {
    /// Registry-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Durable name.
    pub fn durable(&self) -> &str {
        &self.durable
    }
}

/// Snapshot returned by `SubscriptionRegistry::list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Handle of the subscription.
    pub handle: SubscriptionHandle,
    /// Last-acked sequence.
    pub last_acked: u64,
    /// Session the pump is attached to, if running.
    pub session: Option<u64>,
}

#[derive(Default)]
struct Position {
    last_acked: u64,
    in_flight: Option<(u64, u32)>,
}

pub(crate) struct PumpHandle {
    pub(crate) session: u64,
    pub(crate) token: CancellationToken,
    pub(crate) join: JoinHandle<()>,
}

pub(crate) struct Subscription {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) bridge: HandlerBridge,
    position: Mutex<Position>,
    pump: Mutex<Option<PumpHandle>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        subject: &str,
        durable: &str,
        bridge: HandlerBridge,
        last_acked: u64,
    ) -> Self {
        Self {
            handle: SubscriptionHandle {
                id,
                subject: Arc::from(subject),
                durable: Arc::from(durable),
            },
            bridge,
            position: Mutex::new(Position {
                last_acked,
                in_flight: None,
            }),
            pump: Mutex::new(None),
        }
    }

    pub(crate) fn subject(&self) -> &Arc<str> {
        &self.handle.subject
    }

    pub(crate) fn durable(&self) -> &Arc<str> {
        &self.handle.durable
    }

    pub(crate) fn last_acked(&self) -> u64 {
        lock(&self.position).last_acked
    }

    /// Moves the position forward to `seq`; returns false if it was already there.
    pub(crate) fn advance(&self, seq: u64) -> bool {
        let mut pos = lock(&self.position);
        if pos.in_flight.is_some_and(|(s, _)| s <= seq) {
            pos.in_flight = None;
        }
        if seq > pos.last_acked {
            pos.last_acked = seq;
            true
        } else {
            false
        }
    }

    /// Attempts already made for `seq` (0 if it is not the message in flight).
    pub(crate) fn attempts_for(&self, seq: u64) -> u32 {
        match lock(&self.position).in_flight {
            Some((s, n)) if s == seq => n,
            _ => 0,
        }
    }

    pub(crate) fn record_attempt(&self, seq: u64, attempt: u32) {
        lock(&self.position).in_flight = Some((seq, attempt));
    }

    pub(crate) fn attached_to(&self) -> Option<u64> {
        lock(&self.pump)
            .as_ref()
            .filter(|p| !p.join.is_finished())
            .map(|p| p.session)
    }

    pub(crate) fn set_pump(&self, pump: PumpHandle) -> Option<PumpHandle> {
        lock(&self.pump).replace(pump)
    }

    pub(crate) fn take_pump(&self) -> Option<PumpHandle> {
        lock(&self.pump).take()
    }

    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            handle: self.handle.clone(),
            last_acked: self.last_acked(),
            session: self.attached_to(),
        }
    }
}
