//! # busvisor
//!
//! **Busvisor** is the reliable ingestion core of a message-bus consumer.
//!
//! It keeps one logical connection to a persistent bus alive across network
//! failures, maintains durable subscriptions that survive reconnects, and
//! delivers every message to application handlers in order, at least once,
//! with bounded redelivery and dead-lettering. The wire protocol stays behind
//! the [`transport`] traits.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!            subscribe(subject, durable, handler)
//!                          │
//! ┌────────────────────────▼──────────────────────────────────────────┐
//! │  Ingestor                                                         │
//! │  - ConnectionManager (dial, supervise, reconnect with backoff)    │
//! │  - SubscriptionRegistry (durables, positions, restore on session) │
//! │  - Bus + SubscriberSet (runtime events → subscribers)             │
//! └──────┬───────────────────────────────┬────────────────────────────┘
//!        │ sessions (watch)              │ one pump per subscription
//!        ▼                               ▼
//!  ┌────────────┐   restore_all   ┌──────────────┐  ┌──────────────┐
//!  │  Session   │ ──────────────► │ DeliveryPump │  │ DeliveryPump │
//!  │ (id = n)   │                 │  durable A   │  │  durable B   │
//!  └─────┬──────┘                 └──────┬───────┘  └──────┬───────┘
//!        │ Connector / Connection        │ HandlerBridge   │
//!        ▼                               ▼                 ▼
//!   message bus                     handler A          handler B
//!                                        │
//!                                        └─► DeadLetterSink / PositionStore
//! ```
//!
//! ### Delivery
//! ```text
//! message(seq)
//!   ├─ seq ≤ last_acked ─► re-ack, skip
//!   └─ attempt = 1..=max_attempts
//!        ├─ Ack            ─► save, ack, last_acked = seq
//!        ├─ Nack / Fatal   ─► dead-letter, ack, last_acked = seq
//!        └─ Retry / Fail / Timeout / Panic
//!             ├─ attempts left ─► sleep(redelivery backoff), again
//!             └─ exhausted     ─► dead-letter, ack, last_acked = seq
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                            |
//! |-------------------|----------------------------------------------------------|-----------------------------------------------|
//! | **Connection**    | Reconnect with capped, jittered backoff; fatal on auth.  | [`ConnectionManager`], [`Session`]            |
//! | **Subscriptions** | Durable, restored on every session, resume at ack + 1.   | [`SubscriptionRegistry`], [`SubscriptionHandle`] |
//! | **Handlers**      | Closure or trait handlers with timeout and panic capture.| [`Handler`], [`HandlerFn`], [`HandlerBridge`] |
//! | **Policies**      | Reconnect and redelivery schedules.                      | [`BackoffPolicy`], [`RedeliveryPolicy`]       |
//! | **Sinks**         | Dead letters and persisted positions.                    | [`DeadLetterSink`], [`PositionStore`]         |
//! | **Subscriber API**| Observe runtime events (logging, metrics).               | [`Subscribe`], [`Event`]                      |
//! | **Errors**        | Typed errors with stable labels.                         | [`ConnectionError`], [`SubscriptionError`], [`HandlerError`] |
//!
//! ## Optional features
//! - `logging` (default): exports [`LogWriter`], a subscriber writing events through `tracing`.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use busvisor::{Config, HandlerError, HandlerFn, HandlerRef, Ingestor, Message, Outcome};
//! use busvisor::transport::memory::MemoryBus;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let net = MemoryBus::new();
//!     for id in 1..=3 {
//!         net.publish("orders", format!("{{\"order\":{id}}}"));
//!     }
//!
//!     #[cfg(feature = "logging")]
//!     let subs: Vec<Arc<dyn busvisor::Subscribe>> = vec![Arc::new(busvisor::LogWriter::new())];
//!     #[cfg(not(feature = "logging"))]
//!     let subs: Vec<Arc<dyn busvisor::Subscribe>> = Vec::new();
//!
//!     let mut cfg = Config::new("mem://local");
//!     cfg.handler_timeout = Duration::from_secs(1);
//!
//!     let ingestor = Ingestor::builder(cfg, Arc::new(net.clone()))
//!         .with_subscribers(subs)
//!         .build();
//!     ingestor.start().await?;
//!
//!     let handler: HandlerRef = HandlerFn::arc(|msg: Message, _ctx: CancellationToken| async move {
//!         println!("order {} ({} bytes)", msg.seq(), msg.payload().len());
//!         Ok::<_, HandlerError>(Outcome::Ack)
//!     });
//!     let sub = ingestor.subscribe("orders", "orders-worker", handler).await?;
//!
//!     while ingestor.last_acked(&sub).await < Some(3) {
//!         tokio::time::sleep(Duration::from_millis(5)).await;
//!     }
//!     ingestor.close().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod core;
mod dead_letter;
mod error;
mod events;
mod handler;
mod message;
mod policies;
mod store;
mod subscribers;

pub mod transport;

// ---- Public re-exports ----

pub use config::{Config, Credentials};
pub use crate::core::{
    ConnectionManager, HandlerBridge, Ingestor, IngestorBuilder, Session, SessionState,
    SubscriptionHandle, SubscriptionInfo, SubscriptionRegistry,
};
pub use dead_letter::{DeadLetter, DeadLetterSink, LogDeadLetters};
pub use error::{
    ConnectionError, DeadLetterError, HandlerError, RuntimeError, SubscriptionError,
    TransportError,
};
pub use events::{Bus, Event, EventKind};
pub use handler::{Handler, HandlerFn, HandlerRef};
pub use message::{Message, Outcome};
pub use policies::{BackoffPolicy, JitterPolicy, RedeliveryPolicy};
pub use store::{MemoryPositionStore, PositionStore};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: built-in subscriber that logs events through `tracing`.
// Enable with: `--features logging` (on by default)
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
