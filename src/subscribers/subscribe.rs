//! # Subscriber contract.
//!
//! Each subscriber is driven by a dedicated worker fed by a bounded queue owned
//! by the [`SubscriberSet`](crate::SubscriberSet). Overflowing queues drop events
//! for that subscriber only and report `SubscriberOverflow`.

use crate::events::Event;
use async_trait::async_trait;

/// Contract for event subscribers.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles a single event.
    async fn on_event(&self, event: &Event);

    /// Name used in logs and overflow/panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred queue capacity for this subscriber.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
