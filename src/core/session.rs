//! # Sessions.
//!
//! A [`Session`] is one established connection as seen by the rest of the
//! core. Every reconnect produces a new session with a fresh id; subscription
//! declarations never outlive the session they were made on.

use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;
use crate::transport::{Connection, MessageStream};

/// Connection lifecycle as tracked by the manager.
///
/// ```text
/// Connecting ──► Connected ──► Disconnected ──► Connecting ...
///      │                                │
///      └──────────────► Closed ◄────────┘   (close() or fatal error)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Dialing (first connect or reconnect).
    Connecting,
    /// A live session exists.
    Connected,
    /// The last session dropped; a reconnect follows.
    Disconnected,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Stable lowercase label.
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Closed => "closed",
        }
    }
}

/// Handle to one live connection.
#[derive(Clone)]
pub struct Session {
    id: u64,
    conn: Arc<dyn Connection>,
}

impl Session {
    pub(crate) fn new(id: u64, conn: Arc<dyn Connection>) -> Self {
        Self { id, conn }
    }

    /// Identity, unique per manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Declares a durable subscription on this session.
    pub async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        start_seq: u64,
    ) -> Result<Box<dyn MessageStream>, TransportError> {
        self.conn.subscribe(subject, durable, start_seq).await
    }

    /// Acknowledges `seq` for `durable`.
    pub async fn ack(&self, subject: &str, durable: &str, seq: u64) -> Result<(), TransportError> {
        self.conn.ack(subject, durable, seq).await
    }

    pub(crate) async fn disconnected(&self) -> TransportError {
        self.conn.disconnected().await
    }

    pub(crate) async fn close(&self) {
        self.conn.close().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
