//! # MemoryBus: in-process transport with fault injection.
//!
//! Stores every published message per subject (sequences start at 1) and
//! tracks durable bindings and acknowledgments the way a persistent bus does:
//!
//! - A durable is bound to one subject for its lifetime; binding it to another
//!   subject is a `Conflict`.
//! - A durable can be bound by one live stream at a time. Bindings held by a
//!   dropped connection are stale and may be taken over.
//! - Messages at or below the highest sequence ever delivered to a durable are
//!   flagged as redelivered.
//!
//! ## Fault injection
//! - [`MemoryBus::drop_connections`] kills every live connection.
//! - [`MemoryBus::refuse_connections`] makes the next `n` dials fail.
//! - [`MemoryBus::set_offline`] makes every dial fail until cleared.
//! - [`MemoryBus::require_secret`] rejects dials without the matching secret.
//!
//! ## Example
//! ```rust
//! use busvisor::transport::memory::MemoryBus;
//!
//! let bus = MemoryBus::new();
//! assert_eq!(bus.publish("orders", "a"), 1);
//! assert_eq!(bus.publish("orders", "b"), 2);
//! assert_eq!(bus.published("orders"), 2);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Connection, Connector, MessageStream};
use crate::{config::Credentials, error::TransportError, message::Message};

#[derive(Default)]
struct Durable {
    subject: String,
    binding: Option<Binding>,
    delivered: u64,
    acked: u64,
    acks: Vec<u64>,
}

struct Binding {
    id: u64,
    link: CancellationToken,
}

struct State {
    subjects: HashMap<String, Vec<Bytes>>,
    durables: HashMap<String, Durable>,
    link: CancellationToken,
    refuse_next: u32,
    offline: bool,
    secret: Option<String>,
    dials: u64,
    next_binding: u64,
}

struct Inner {
    state: Mutex<State>,
    published: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-process message bus; cheap to clone, clones share state.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Creates an empty bus accepting any credentials.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    subjects: HashMap::new(),
                    durables: HashMap::new(),
                    link: CancellationToken::new(),
                    refuse_next: 0,
                    offline: false,
                    secret: None,
                    dials: 0,
                    next_binding: 0,
                }),
                published: Notify::new(),
            }),
        }
    }

    /// Appends a message to `subject` and returns its sequence.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> u64 {
        let seq = {
            let mut st = self.inner.lock();
            let log = st.subjects.entry(subject.to_string()).or_default();
            log.push(payload.into());
            log.len() as u64
        };
        self.inner.published.notify_waiters();
        seq
    }

    /// Number of messages ever published on `subject`.
    pub fn published(&self, subject: &str) -> u64 {
        self.inner
            .lock()
            .subjects
            .get(subject)
            .map_or(0, |log| log.len() as u64)
    }

    /// Kills every live connection; later dials succeed as usual.
    pub fn drop_connections(&self) {
        let old = {
            let mut st = self.inner.lock();
            std::mem::replace(&mut st.link, CancellationToken::new())
        };
        old.cancel();
        self.inner.published.notify_waiters();
    }

    /// Makes the next `n` dials fail with `Unreachable`.
    pub fn refuse_connections(&self, n: u32) {
        self.inner.lock().refuse_next = n;
    }

    /// While offline, every dial fails with `Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Rejects dials whose credentials do not carry `secret`.
    pub fn require_secret(&self, secret: impl Into<String>) {
        self.inner.lock().secret = Some(secret.into());
    }

    /// Number of dial attempts so far.
    pub fn dials(&self) -> u64 {
        self.inner.lock().dials
    }

    /// Highest sequence acknowledged for `durable` (0 if none).
    pub fn acked(&self, durable: &str) -> u64 {
        self.inner.lock().durables.get(durable).map_or(0, |d| d.acked)
    }

    /// Every acknowledgment received for `durable`, in arrival order.
    pub fn acks(&self, durable: &str) -> Vec<u64> {
        self.inner
            .lock()
            .durables
            .get(durable)
            .map(|d| d.acks.clone())
            .unwrap_or_default()
    }

    /// True if a live stream currently holds `durable`.
    pub fn is_bound(&self, durable: &str) -> bool {
        self.inner
            .lock()
            .durables
            .get(durable)
            .and_then(|d| d.binding.as_ref())
            .is_some_and(|b| !b.link.is_cancelled())
    }
}

#[async_trait]
impl Connector for MemoryBus {
    async fn connect(
        &self,
        _endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let mut st = self.inner.lock();
        st.dials += 1;

        if st.offline {
            return Err(TransportError::Unreachable("bus offline".into()));
        }
        if st.refuse_next > 0 {
            st.refuse_next -= 1;
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        if let Some(secret) = &st.secret {
            if credentials.map(|c| c.secret.as_str()) != Some(secret.as_str()) {
                return Err(TransportError::Unauthorized("bad credentials".into()));
            }
        }

        let link = Arc::new(Link {
            token: st.link.child_token(),
            closed: AtomicBool::new(false),
        });
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            link,
        }))
    }
}

struct Link {
    token: CancellationToken,
    closed: AtomicBool,
}

impl Link {
    fn error(&self) -> TransportError {
        if self.closed.load(Ordering::Acquire) {
            TransportError::Closed
        } else {
            TransportError::Disconnected("link dropped".into())
        }
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.token.is_cancelled() {
            Err(self.error())
        } else {
            Ok(())
        }
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    link: Arc<Link>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        start_seq: u64,
    ) -> Result<Box<dyn MessageStream>, TransportError> {
        self.link.check()?;

        let mut st = self.inner.lock();
        st.next_binding += 1;
        let id = st.next_binding;

        let entry = st
            .durables
            .entry(durable.to_string())
            .or_insert_with(|| Durable {
                subject: subject.to_string(),
                ..Durable::default()
            });
        if entry.subject != subject {
            return Err(TransportError::Conflict(format!(
                "durable {durable} is bound to subject {}",
                entry.subject
            )));
        }
        if entry.binding.as_ref().is_some_and(|b| !b.link.is_cancelled()) {
            return Err(TransportError::Conflict(format!("durable {durable} is in use")));
        }
        entry.binding = Some(Binding {
            id,
            link: self.link.token.clone(),
        });

        Ok(Box::new(MemoryStream {
            inner: Arc::clone(&self.inner),
            link: Arc::clone(&self.link),
            subject: Arc::from(subject),
            durable: durable.to_string(),
            binding: id,
            cursor: start_seq.max(1),
        }))
    }

    async fn ack(&self, _subject: &str, durable: &str, seq: u64) -> Result<(), TransportError> {
        self.link.check()?;
        let mut st = self.inner.lock();
        let d = st
            .durables
            .get_mut(durable)
            .ok_or_else(|| TransportError::Rejected(format!("unknown durable {durable}")))?;
        d.acked = d.acked.max(seq);
        d.acks.push(seq);
        Ok(())
    }

    async fn disconnected(&self) -> TransportError {
        self.link.token.cancelled().await;
        self.link.error()
    }

    async fn close(&self) {
        self.link.closed.store(true, Ordering::Release);
        self.link.token.cancel();
    }
}

struct MemoryStream {
    inner: Arc<Inner>,
    link: Arc<Link>,
    subject: Arc<str>,
    durable: String,
    binding: u64,
    cursor: u64,
}

impl MemoryStream {
    fn fetch(&mut self) -> Option<Message> {
        let mut st = self.inner.lock();
        let payload = st
            .subjects
            .get(self.subject.as_ref())
            .and_then(|log| log.get((self.cursor - 1) as usize))
            .cloned()?;

        let seq = self.cursor;
        self.cursor += 1;

        let mut msg = Message::new(Arc::clone(&self.subject), seq, payload);
        if let Some(d) = st.durables.get_mut(&self.durable) {
            if seq <= d.delivered {
                msg = msg.redelivered();
            }
            d.delivered = d.delivered.max(seq);
        }
        Some(msg)
    }
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Message, TransportError>> {
        let inner = Arc::clone(&self.inner);
        loop {
            let notified = inner.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Err(e) = self.link.check() {
                return Some(Err(e));
            }
            if let Some(msg) = self.fetch() {
                return Some(Ok(msg));
            }

            tokio::select! {
                _ = notified => {}
                _ = self.link.token.cancelled() => {}
            }
        }
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let mut st = self.inner.lock();
        if let Some(d) = st.durables.get_mut(&self.durable) {
            if d.binding.as_ref().is_some_and(|b| b.id == self.binding) {
                d.binding = None;
            }
        }
    }
}
