//! # Transport seam.
//!
//! The bus wire protocol is opaque to the core. A transport provides three
//! object-safe traits:
//!
//! ```text
//! Connector::connect(endpoint, credentials) ──► Arc<dyn Connection>
//! Connection::subscribe(subject, durable, start_seq) ──► Box<dyn MessageStream>
//! Connection::ack(subject, durable, seq)
//! Connection::disconnected()   resolves once the link is gone
//! Connection::close()
//! MessageStream::next()        next message in sequence order
//! ```
//!
//! Only the [`ConnectionManager`](crate::ConnectionManager) holds a
//! `Connection`; everything else goes through [`Session`](crate::Session).
//! Dropping a stream releases its durable binding.
//!
//! [`memory::MemoryBus`] is an in-process implementation with fault injection.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{config::Credentials, error::TransportError, message::Message};

/// Dials the bus.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection.
    async fn connect(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One live link to the bus.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Binds `durable` to `subject` and streams messages from `start_seq` on.
    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        start_seq: u64,
    ) -> Result<Box<dyn MessageStream>, TransportError>;

    /// Acknowledges `seq` for `durable`.
    async fn ack(&self, subject: &str, durable: &str, seq: u64) -> Result<(), TransportError>;

    /// Resolves when the link is gone, with the reason.
    async fn disconnected(&self) -> TransportError;

    /// Closes the link; pending streams end.
    async fn close(&self);
}

/// Ordered stream of messages for one durable binding.
#[async_trait]
pub trait MessageStream: Send + 'static {
    /// Next message; `Some(Err(_))` or `None` once the binding is unusable.
    async fn next(&mut self) -> Option<Result<Message, TransportError>>;
}
