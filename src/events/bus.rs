//! # Broadcast bus for runtime events.
//!
//! ```text
//! Publishers (many):                         Listener (one):
//!   ConnectionManager ──┐
//!   SubscriptionRegistry┼──► Bus ──► Ingestor listener ──► SubscriberSet
//!   DeliveryPump × N  ──┤  (broadcast)
//!   HandlerBridge     ──┘
//! ```
//!
//! ## Rules
//! - `publish()` never blocks.
//! - One bounded ring buffer is shared by all receivers; laggards observe
//!   `RecvError::Lagged(n)` and skip the `n` oldest events.
//! - Events published while nobody listens are dropped.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus with the given capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to every live receiver.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates an independent receiver for events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
