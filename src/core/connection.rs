//! # ConnectionManager: one logical connection, many sessions.
//!
//! Owns the transport connection exclusively and keeps it alive:
//!
//! ```text
//! connect()
//!   └─► establish() ── dial ──► Ok ─────────────► publish Session on watch
//!          │  ▲                                   spawn supervise()
//!          │  └── ReconnectScheduled + sleep ◄── retryable failure
//!          └─► fatal (auth / ceiling) ──► Closed, closed() = Err
//!
//! supervise()
//!   loop {
//!     select {
//!       token.cancelled()         → close connection, stop
//!       session.disconnected()    → Disconnected
//!       invalidate(id == current) → close connection, Disconnected
//!     }
//!     sessions ← None, run on_disconnect callbacks
//!     establish() again           → new Session on watch
//!   }
//! ```
//!
//! ## Rules
//! - Authentication failures stop the manager immediately.
//! - Other dial failures are retried with [`BackoffPolicy`] until the ceiling
//!   of consecutive failures is hit (`None` = forever).
//! - Every successful dial yields a [`Session`] with a new id.
//! - `invalidate` for a stale session id is ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use super::session::{Session, SessionState};
use crate::{
    config::{Config, Credentials},
    error::{ConnectionError, TransportError},
    events::{Bus, Event, EventKind},
    policies::BackoffPolicy,
    transport::Connector,
};

type DisconnectListener = Arc<dyn Fn(&TransportError) + Send + Sync>;
type Invalidation = (u64, TransportError);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Maintains the bus connection and reconnects on loss.
pub struct ConnectionManager {
    endpoint: String,
    credentials: Option<Credentials>,
    backoff: BackoffPolicy,
    ceiling: Option<u32>,
    dial_timeout: Option<Duration>,
    connector: Arc<dyn Connector>,
    bus: Bus,
    token: CancellationToken,

    started: AtomicBool,
    finished: AtomicBool,
    next_id: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    session_tx: watch::Sender<Option<Session>>,
    last_error: Mutex<Option<ConnectionError>>,
    fatal: Mutex<Option<ConnectionError>>,
    listeners: Mutex<Vec<DisconnectListener>>,
    invalidate_tx: mpsc::UnboundedSender<Invalidation>,
    invalidate_rx: Mutex<Option<mpsc::UnboundedReceiver<Invalidation>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a manager; nothing is dialed until [`connect`](Self::connect).
    pub fn new(cfg: &Config, connector: Arc<dyn Connector>, bus: Bus) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (session_tx, _) = watch::channel(None);
        let (invalidate_tx, invalidate_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            endpoint: cfg.endpoint.clone(),
            credentials: cfg.credentials.clone(),
            backoff: cfg.reconnect,
            ceiling: cfg.reconnect_limit(),
            dial_timeout: cfg.dial_timeout(),
            connector,
            bus,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            state_tx,
            session_tx,
            last_error: Mutex::new(None),
            fatal: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            invalidate_tx,
            invalidate_rx: Mutex::new(Some(invalidate_rx)),
            supervisor: Mutex::new(None),
        })
    }

    /// Establishes the first session and starts supervising it.
    ///
    /// Retries with backoff up to the ceiling. A second call waits for the
    /// current (or next) session instead of dialing again.
    pub async fn connect(self: &Arc<Self>) -> Result<Session, ConnectionError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return self.wait_session().await;
        }

        let rx = lock(&self.invalidate_rx).take();
        let session = match self.establish().await {
            Ok(s) => s,
            Err(e) => {
                let fatal = (e != ConnectionError::Closed).then(|| e.clone());
                self.finish(fatal);
                return Err(e);
            }
        };
        self.session_tx.send_replace(Some(session.clone()));

        if let Some(rx) = rx {
            let me = Arc::clone(self);
            let first = session.clone();
            let handle = tokio::spawn(async move { me.supervise(first, rx).await });
            *lock(&self.supervisor) = Some(handle);
        }
        Ok(session)
    }

    /// Registers a callback run after every session loss, before reconnecting.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(callback));
    }

    /// Stops reconnecting, closes the live connection and waits until the
    /// manager reports `Closed`.
    pub async fn close(&self) {
        self.token.cancel();
        if !self.started.load(Ordering::Acquire) {
            self.finish(None);
        }

        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;

        let handle = lock(&self.supervisor).take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    /// Resolves once the manager stopped: `Ok` after [`close`](Self::close),
    /// `Err` with the fatal error otherwise.
    pub async fn closed(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
        match lock(&self.fatal).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current live session, if any.
    pub fn session(&self) -> Option<Session> {
        self.session_tx.borrow().clone()
    }

    /// Receiver observing session changes (`None` while disconnected).
    pub fn sessions(&self) -> watch::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Most recent connection failure.
    pub fn last_error(&self) -> Option<ConnectionError> {
        lock(&self.last_error).clone()
    }

    /// Forces a reconnect if `session_id` is still the live session.
    pub fn invalidate(&self, session_id: u64, err: TransportError) {
        let _ = self.invalidate_tx.send((session_id, err));
    }

    /// Token cancelled when the manager closes.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    async fn wait_session(&self) -> Result<Session, ConnectionError> {
        let mut rx = self.session_tx.subscribe();
        loop {
            if let Some(s) = rx.borrow_and_update().clone() {
                return Ok(s);
            }
            if self.state() == SessionState::Closed {
                return Err(lock(&self.fatal).clone().unwrap_or(ConnectionError::Closed));
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Dials until success, a fatal error, the ceiling, or cancellation.
    async fn establish(&self) -> Result<Session, ConnectionError> {
        let mut failures: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                return Err(ConnectionError::Closed);
            }

            self.state_tx.send_replace(SessionState::Connecting);
            self.bus
                .publish(Event::new(EventKind::Connecting).with_attempt(failures + 1));

            let dial = self
                .connector
                .connect(&self.endpoint, self.credentials.as_ref());
            let res = match self.dial_timeout {
                Some(limit) => select! {
                    _ = self.token.cancelled() => return Err(ConnectionError::Closed),
                    r = time::timeout(limit, dial) => r.unwrap_or_else(|_| {
                        Err(TransportError::Unreachable(format!("dial timed out after {limit:?}")))
                    }),
                },
                None => select! {
                    _ = self.token.cancelled() => return Err(ConnectionError::Closed),
                    r = dial => r,
                },
            };

            let err = match res {
                Ok(conn) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    self.state_tx.send_replace(SessionState::Connected);
                    self.bus.publish(
                        Event::new(EventKind::Connected)
                            .with_session(id)
                            .with_state(SessionState::Connected),
                    );
                    return Ok(Session::new(id, conn));
                }
                Err(e) => ConnectionError::from_transport(&self.endpoint, e),
            };

            failures += 1;
            *lock(&self.last_error) = Some(err.clone());
            self.bus.publish(
                Event::new(EventKind::ConnectFailed)
                    .with_attempt(failures)
                    .with_reason(err.as_message()),
            );

            if err.is_fatal() {
                self.publish_exhausted(failures, &err);
                return Err(err);
            }
            if self.ceiling.is_some_and(|limit| failures >= limit) {
                let err = ConnectionError::Exhausted {
                    attempts: failures,
                    last: err.as_message(),
                };
                self.publish_exhausted(failures, &err);
                return Err(err);
            }

            let delay = self.backoff.next(failures - 1);
            self.bus.publish(
                Event::new(EventKind::ReconnectScheduled)
                    .with_attempt(failures)
                    .with_delay(delay),
            );

            let sleep = time::sleep(delay);
            tokio::pin!(sleep);
            select! {
                _ = &mut sleep => {}
                _ = self.token.cancelled() => return Err(ConnectionError::Closed),
            }
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut session: Session,
        mut invalidations: mpsc::UnboundedReceiver<Invalidation>,
    ) {
        let fatal = loop {
            let reason = select! {
                _ = self.token.cancelled() => {
                    session.close().await;
                    break None;
                }
                r = session.disconnected() => r,
                Some((id, err)) = invalidations.recv() => {
                    if id != session.id() {
                        continue;
                    }
                    session.close().await;
                    err
                }
            };

            self.lose_session(&session, &reason);

            match self.establish().await {
                Ok(next) => {
                    session = next;
                    self.session_tx.send_replace(Some(session.clone()));
                }
                Err(ConnectionError::Closed) => break None,
                Err(e) => break Some(e),
            }
        };

        self.finish(fatal);
    }

    fn lose_session(&self, session: &Session, reason: &TransportError) {
        self.session_tx.send_replace(None);
        self.state_tx.send_replace(SessionState::Disconnected);
        *lock(&self.last_error) = Some(ConnectionError::from_transport(
            &self.endpoint,
            reason.clone(),
        ));
        self.bus.publish(
            Event::new(EventKind::Disconnected)
                .with_session(session.id())
                .with_state(SessionState::Disconnected)
                .with_reason(reason.to_string()),
        );

        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(reason);
        }
    }

    fn publish_exhausted(&self, attempts: u32, err: &ConnectionError) {
        self.bus.publish(
            Event::new(EventKind::ReconnectExhausted)
                .with_attempt(attempts)
                .with_reason(err.as_message()),
        );
    }

    fn finish(&self, fatal: Option<ConnectionError>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();

        let mut ev = Event::new(EventKind::Closed).with_state(SessionState::Closed);
        if let Some(e) = &fatal {
            *lock(&self.last_error) = Some(e.clone());
            ev = ev.with_reason(e.as_message());
        }
        *lock(&self.fatal) = fatal;

        self.state_tx.send_replace(SessionState::Closed);
        self.session_tx.send_replace(None);
        self.bus.publish(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::JitterPolicy;
    use crate::transport::memory::MemoryBus;

    fn cfg() -> Config {
        Config {
            reconnect: BackoffPolicy {
                initial: Duration::from_millis(5),
                cap: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: JitterPolicy::None,
            },
            reconnect_ceiling: 3,
            ..Config::new("mem://test")
        }
    }

    #[tokio::test]
    async fn connect_retries_refused_dials() {
        let net = MemoryBus::new();
        net.refuse_connections(2);
        let mgr = ConnectionManager::new(&cfg(), Arc::new(net.clone()), Bus::new(64));

        let session = mgr.connect().await.expect("third dial succeeds");
        assert_eq!(session.id(), 1);
        assert_eq!(net.dials(), 3);
        assert_eq!(mgr.state(), SessionState::Connected);
        assert!(mgr.last_error().is_some());

        mgr.close().await;
        assert_eq!(mgr.state(), SessionState::Closed);
        assert_eq!(mgr.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn bad_credentials_are_fatal_without_retry() {
        let net = MemoryBus::new();
        net.require_secret("right");
        let config = cfg().with_credentials(Credentials::new("svc", "wrong"));
        let mgr = ConnectionManager::new(&config, Arc::new(net.clone()), Bus::new(64));

        let err = mgr.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthorized { .. }));
        assert_eq!(net.dials(), 1);
        assert_eq!(mgr.state(), SessionState::Closed);
        assert_eq!(mgr.closed().await, Err(err));
    }

    /// Reports the link as closed for the first `left` dials.
    struct ClosedWhileDialing {
        net: MemoryBus,
        left: AtomicU64,
    }

    #[async_trait::async_trait]
    impl Connector for ClosedWhileDialing {
        async fn connect(
            &self,
            endpoint: &str,
            credentials: Option<&Credentials>,
        ) -> Result<Arc<dyn crate::transport::Connection>, TransportError> {
            if self.left.load(Ordering::SeqCst) > 0 {
                self.left.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Closed);
            }
            self.net.connect(endpoint, credentials).await
        }
    }

    #[tokio::test]
    async fn closed_while_dialing_is_retried() {
        let net = MemoryBus::new();
        let connector = ClosedWhileDialing {
            net: net.clone(),
            left: AtomicU64::new(1),
        };
        let mgr = ConnectionManager::new(&cfg(), Arc::new(connector), Bus::new(64));

        let session = mgr.connect().await.expect("second dial succeeds");
        assert_eq!(session.id(), 1);
        assert_eq!(net.dials(), 1);
        assert_eq!(mgr.state(), SessionState::Connected);
        assert!(matches!(
            mgr.last_error(),
            Some(ConnectionError::Unreachable { .. })
        ));

        mgr.close().await;
        assert_eq!(mgr.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn ceiling_exhausts() {
        let net = MemoryBus::new();
        net.set_offline(true);
        let mgr = ConnectionManager::new(&cfg(), Arc::new(net.clone()), Bus::new(64));

        match mgr.connect().await {
            Err(ConnectionError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(net.dials(), 3);
    }

    #[tokio::test]
    async fn reconnects_after_drop_and_notifies_listeners() {
        let net = MemoryBus::new();
        let mgr = ConnectionManager::new(&cfg(), Arc::new(net.clone()), Bus::new(64));
        let drops = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&drops);
        mgr.on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = mgr.connect().await.unwrap();
        let mut sessions = mgr.sessions();
        net.drop_connections();

        let next = loop {
            sessions.changed().await.unwrap();
            if let Some(s) = sessions.borrow_and_update().clone() {
                break s;
            }
        };
        assert!(next.id() > first.id());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            mgr.last_error(),
            Some(ConnectionError::Unreachable { .. })
        ));

        mgr.close().await;
    }

    #[tokio::test]
    async fn stale_invalidation_is_ignored() {
        let net = MemoryBus::new();
        let mgr = ConnectionManager::new(&cfg(), Arc::new(net.clone()), Bus::new(64));
        let first = mgr.connect().await.unwrap();

        mgr.invalidate(first.id() + 10, TransportError::Disconnected("old".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.session().map(|s| s.id()), Some(first.id()));

        mgr.invalidate(first.id(), TransportError::Disconnected("broken".into()));
        let mut sessions = mgr.sessions();
        let next = loop {
            if let Some(s) = sessions.borrow_and_update().clone() {
                if s.id() != first.id() {
                    break s;
                }
            }
            sessions.changed().await.unwrap();
        };
        assert_eq!(next.id(), first.id() + 1);
        mgr.close().await;
    }
}
