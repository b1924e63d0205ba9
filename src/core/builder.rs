use std::sync::Arc;

use super::{connection::ConnectionManager, ingestor::Ingestor, registry::SubscriptionRegistry};
use crate::{
    config::Config,
    dead_letter::{DeadLetterSink, LogDeadLetters},
    events::Bus,
    store::{MemoryPositionStore, PositionStore},
    subscribers::{Subscribe, SubscriberSet},
    transport::Connector,
};

/// Builder for an [`Ingestor`] with optional sinks and subscribers.
pub struct IngestorBuilder {
    cfg: Config,
    connector: Arc<dyn Connector>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    positions: Option<Arc<dyn PositionStore>>,
}

impl IngestorBuilder {
    /// Creates a builder with the given configuration and transport.
    pub fn new(cfg: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            cfg,
            connector,
            subscribers: Vec::new(),
            dead_letters: None,
            positions: None,
        }
    }

    /// Sets event subscribers.
    ///
    /// Each one gets its own bounded queue and worker.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the dead-letter sink (default: [`LogDeadLetters`]).
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Sets the position store (default: [`MemoryPositionStore`]).
    pub fn with_positions(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.positions = Some(store);
        self
    }

    /// Builds the ingestor and spawns its listeners.
    ///
    /// Must be called inside a tokio runtime. Nothing is dialed until
    /// [`Ingestor::start`].
    pub fn build(self) -> Arc<Ingestor> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let manager = ConnectionManager::new(&self.cfg, self.connector, bus.clone());

        let registry = SubscriptionRegistry::new(
            Arc::clone(&manager),
            bus.clone(),
            self.cfg.redelivery_policy(),
            self.cfg.handler_deadline(),
            self.dead_letters.unwrap_or_else(|| Arc::new(LogDeadLetters)),
            self.positions
                .unwrap_or_else(|| Arc::new(MemoryPositionStore::new())),
        );

        Arc::new(Ingestor::new_internal(
            self.cfg, bus, subs, manager, registry,
        ))
    }
}
