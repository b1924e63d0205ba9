//! # Event subscribers.
//!
//! Subscribers observe every [`Event`](crate::Event) the runtime publishes:
//! connection state changes, subscription restores, delivery attempts, dead
//! letters. Each subscriber gets its own bounded queue and worker, so a slow
//! metrics exporter never stalls delivery.
//!
//! ```text
//! Bus ──► Ingestor listener ──► SubscriberSet::emit(&Event)
//!                                   ├──► [queue] ─► worker ─► LogWriter::on_event
//!                                   └──► [queue] ─► worker ─► Custom::on_event
//! ```
//!
//! ## Implementing a subscriber
//! ```no_run
//! use busvisor::{Event, EventKind, Subscribe};
//! use async_trait::async_trait;
//!
//! struct DeadLetterCounter;
//!
//! #[async_trait]
//! impl Subscribe for DeadLetterCounter {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::DeadLettered {
//!             // bump a counter
//!         }
//!     }
//!     fn name(&self) -> &'static str { "dead-letter-counter" }
//! }
//! ```

mod set;
mod subscribe;

#[cfg(feature = "logging")]
mod log;

pub(crate) use set::panic_message;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
