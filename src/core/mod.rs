//! Ingestion core: connection, subscriptions, delivery.
//!
//! The public surface is [`Ingestor`] (assembled via [`IngestorBuilder`]) plus
//! the components it wires, which can also be used on their own.
//!
//! Internal modules:
//! - [`connection`]: keeps one logical connection alive across sessions;
//! - [`registry`]: durable subscriptions, restored on every new session;
//! - [`pump`]: ordered per-subscription delivery with bounded redelivery;
//! - [`bridge`]: one handler invocation with timeout and panic isolation;
//! - [`subscription`]: position and attempt record shared by registry and pump.

mod bridge;
mod builder;
mod connection;
mod ingestor;
mod pump;
mod registry;
mod session;
mod subscription;

pub use bridge::HandlerBridge;
pub use builder::IngestorBuilder;
pub use connection::ConnectionManager;
pub use ingestor::Ingestor;
pub use registry::SubscriptionRegistry;
pub use session::{Session, SessionState};
pub use subscription::{SubscriptionHandle, SubscriptionInfo};
