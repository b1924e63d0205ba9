//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] classification and metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ConnectionManager`, `SubscriptionRegistry` (including the
//!   shutdown outcome), delivery pumps, `HandlerBridge` (timeouts).
//! - **Consumer**: the `Ingestor` listener, which forwards every event to the
//!   `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
