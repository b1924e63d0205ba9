//! # Ingestor: the assembled ingestion core.
//!
//! Owns the event bus, the subscriber fan-out, the [`ConnectionManager`] and
//! the [`SubscriptionRegistry`], and wires them together.
//!
//! ## High-level architecture
//! ```text
//! IngestorBuilder::build()
//!   ├─► Bus ──► subscriber listener ──► SubscriberSet::emit(&Event)
//!   ├─► ConnectionManager(connector)
//!   └─► SubscriptionRegistry ──► sessions listener ──► restore_all()
//!
//! start()        → manager.connect()
//! subscribe()    → registry.subscribe()
//! close()        → registry.shutdown(grace)   AllStoppedWithin | GraceExceeded
//!                  manager.close()
//!                  drain remaining events into subscribers
//! ```
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use busvisor::{Config, HandlerError, HandlerFn, Ingestor, Message, Outcome};
//! use busvisor::transport::memory::MemoryBus;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let net = MemoryBus::new();
//!     net.publish("orders", "{\"id\":1}");
//!
//!     let ingestor = Ingestor::builder(Config::new("mem://local"), Arc::new(net.clone())).build();
//!     ingestor.start().await?;
//!
//!     let handler = HandlerFn::arc(|_msg: Message, _ctx: CancellationToken| async {
//!         Ok::<_, HandlerError>(Outcome::Ack)
//!     });
//!     let sub = ingestor.subscribe("orders", "orders-worker", handler).await?;
//!
//!     while ingestor.last_acked(&sub).await < Some(1) {
//!         tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//!     }
//!     ingestor.close().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    builder::IngestorBuilder,
    connection::ConnectionManager,
    registry::SubscriptionRegistry,
    session::{Session, SessionState},
    subscription::{SubscriptionHandle, SubscriptionInfo},
};
use crate::{
    config::Config,
    error::{ConnectionError, RuntimeError, SubscriptionError},
    events::Bus,
    handler::HandlerRef,
    subscribers::SubscriberSet,
    transport::Connector,
};

/// Reliable ingestion from a message bus.
pub struct Ingestor {
    cfg: Config,
    bus: Bus,
    manager: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    subs: Mutex<Option<Arc<SubscriberSet>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    fanout_token: CancellationToken,
}

impl Ingestor {
    /// Starts building an ingestor for `connector`.
    pub fn builder(cfg: Config, connector: Arc<dyn Connector>) -> IngestorBuilder {
        IngestorBuilder::new(cfg, connector)
    }

    pub(crate) fn new_internal(
        cfg: Config,
        bus: Bus,
        subs: Arc<SubscriberSet>,
        manager: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let fanout_token = CancellationToken::new();
        let fanout = spawn_fanout(&bus, Arc::clone(&subs), fanout_token.clone());
        let restore = registry.spawn_listener();

        Self {
            cfg,
            bus,
            manager,
            registry,
            subs: Mutex::new(Some(subs)),
            listeners: Mutex::new(vec![fanout, restore]),
            fanout_token,
        }
    }

    /// Connects (retrying per config) and starts supervising the connection.
    pub async fn start(&self) -> Result<Session, ConnectionError> {
        self.manager.connect().await
    }

    /// Registers a durable subscription; see [`SubscriptionRegistry::subscribe`].
    pub async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        handler: HandlerRef,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        self.registry.subscribe(subject, durable, handler).await
    }

    /// Removes a subscription and returns its final last-acked sequence.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<u64, SubscriptionError> {
        self.registry.unsubscribe(handle).await
    }

    /// Last-acked sequence of a subscription.
    pub async fn last_acked(&self, handle: &SubscriptionHandle) -> Option<u64> {
        self.registry.last_acked(handle).await
    }

    /// Snapshot of all subscriptions.
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.list().await
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.manager.state()
    }

    /// Runtime event bus, for ad-hoc observation.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Resolves when the connection manager stops; a fatal connection error
    /// is returned as [`RuntimeError::Connection`].
    pub async fn closed(&self) -> Result<(), RuntimeError> {
        self.manager.closed().await.map_err(RuntimeError::from)
    }

    /// Stops all pumps within the configured grace, closes the connection
    /// and flushes pending events to subscribers.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        let res = self.registry.shutdown(self.cfg.grace).await;
        self.manager.close().await;

        self.fanout_token.cancel();
        let listeners: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for h in listeners {
            let _ = h.await;
        }

        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(set) = subs.and_then(|s| Arc::try_unwrap(s).ok()) {
            set.shutdown().await;
        }
        res
    }
}

/// Forwards bus events to the subscriber set; on cancel, drains what is
/// already queued and stops.
fn spawn_fanout(bus: &Bus, set: Arc<SubscriberSet>, token: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Ok(ev) => set.emit(&ev),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "subscriber fan-out lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
                _ = token.cancelled() => break,
            }
        }
        loop {
            match rx.try_recv() {
                Ok(ev) => set.emit(&ev),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    })
}
