//! End-to-end delivery scenarios against the in-process bus.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use busvisor::transport::memory::MemoryBus;
use busvisor::transport::{Connection, Connector, MessageStream};
use busvisor::{
    BackoffPolicy, Config, ConnectionError, Credentials, DeadLetter, DeadLetterError,
    DeadLetterSink, Event, EventKind, HandlerError, HandlerFn, HandlerRef, Ingestor,
    MemoryPositionStore, Message, Outcome, PositionStore, RuntimeError, SessionState,
    SubscriptionError, TransportError,
};

fn fast_config() -> Config {
    Config {
        reconnect: BackoffPolicy::fixed(Duration::from_millis(10)),
        reconnect_ceiling: 5,
        connect_timeout: Duration::from_millis(200),
        handler_timeout: Duration::ZERO,
        max_attempts: 3,
        redelivery: BackoffPolicy::fixed(Duration::from_millis(5)),
        grace: Duration::from_secs(1),
        ..Config::new("mem://test")
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Collects events until `done` holds for everything seen so far.
async fn events_until(
    rx: &mut broadcast::Receiver<Event>,
    what: &str,
    done: impl Fn(&[Event]) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    for _ in 0..400 {
        seen.extend(drain(rx));
        if done(&seen) {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn count(events: &[Event], durable: &str, kind: EventKind) -> usize {
    events
        .iter()
        .filter(|e| e.kind == kind && e.durable.as_deref() == Some(durable))
        .count()
}

type Seen = Arc<Mutex<Vec<(u64, u32, bool)>>>;

/// Acks everything, recording `(seq, attempt, redelivered)`.
fn recording_acker(seen: &Seen) -> HandlerRef {
    let seen = Arc::clone(seen);
    HandlerFn::arc(move |msg: Message, _ctx: CancellationToken| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock()
                .unwrap()
                .push((msg.seq(), msg.attempt(), msg.is_redelivered()));
            Ok::<_, HandlerError>(Outcome::Ack)
        }
    })
}

fn seqs(seen: &Seen) -> Vec<u64> {
    seen.lock().unwrap().iter().map(|(s, _, _)| *s).collect()
}

#[derive(Default)]
struct RecordingSink {
    letters: Mutex<Vec<DeadLetter>>,
    refuse_first: AtomicU32,
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let left = self.refuse_first.load(Ordering::SeqCst);
        if left > 0 {
            self.refuse_first.store(left - 1, Ordering::SeqCst);
            return Err(DeadLetterError::new("sink unavailable"));
        }
        self.letters.lock().unwrap().push(letter);
        Ok(())
    }
}

#[tokio::test]
async fn ordered_delivery_survives_reconnect_without_redelivery() {
    let net = MemoryBus::new();
    for i in 1..=5 {
        net.publish("orders", format!("order-{i}"));
    }

    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    ingestor.start().await.unwrap();
    let seen: Seen = Arc::default();
    let sub = ingestor
        .subscribe("orders", "orders-worker", recording_acker(&seen))
        .await
        .unwrap();

    eventually("five acks", || async {
        ingestor.last_acked(&sub).await == Some(5) && net.acked("orders-worker") == 5
    })
    .await;
    assert_eq!(seqs(&seen), vec![1, 2, 3, 4, 5]);

    net.drop_connections();
    eventually("reattached on a new session", || async {
        let session = ingestor.manager().session().map(|s| s.id());
        session.is_some_and(|id| id > 1)
            && ingestor.subscriptions().await[0].session == session
    })
    .await;

    net.publish("orders", "order-6");
    eventually("sixth ack", || async {
        ingestor.last_acked(&sub).await == Some(6) && net.acked("orders-worker") == 6
    })
    .await;

    assert_eq!(seqs(&seen), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(net.acks("orders-worker"), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(ingestor.state(), SessionState::Connected);
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn in_flight_message_resumes_after_reconnect_with_attempt_count() {
    let net = MemoryBus::new();
    for i in 1..=3 {
        net.publish("orders", format!("{i}"));
    }

    let entered = Arc::new(AtomicBool::new(false));
    let seen: Seen = Arc::default();
    let handler: HandlerRef = {
        let entered = Arc::clone(&entered);
        let seen = Arc::clone(&seen);
        HandlerFn::arc(move |msg: Message, ctx: CancellationToken| {
            let entered = Arc::clone(&entered);
            let seen = Arc::clone(&seen);
            async move {
                seen.lock()
                    .unwrap()
                    .push((msg.seq(), msg.attempt(), msg.is_redelivered()));
                if msg.seq() == 2 && msg.attempt() == 1 {
                    entered.store(true, Ordering::SeqCst);
                    ctx.cancelled().await;
                    return Err(HandlerError::Canceled);
                }
                Ok(Outcome::Ack)
            }
        })
    };

    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    ingestor.start().await.unwrap();
    let sub = ingestor.subscribe("orders", "w", handler).await.unwrap();

    eventually("handler blocked on seq 2", || async { entered.load(Ordering::SeqCst) }).await;
    assert_eq!(ingestor.last_acked(&sub).await, Some(1));

    net.drop_connections();
    eventually("all acked", || async {
        ingestor.last_acked(&sub).await == Some(3) && net.acked("w") == 3
    })
    .await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(1, 1, false), (2, 1, false), (2, 2, true), (3, 1, false)]);
    assert_eq!(net.acks("w"), vec![1, 2, 3]);
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn failing_message_gets_exactly_max_attempts_then_dead_letter() {
    let net = MemoryBus::new();
    net.publish("orders", "poison");
    net.publish("orders", "fine");

    let calls = Arc::new(AtomicU32::new(0));
    let handler: HandlerRef = {
        let calls = Arc::clone(&calls);
        HandlerFn::arc(move |msg: Message, _ctx: CancellationToken| {
            let calls = Arc::clone(&calls);
            async move {
                if msg.seq() == 1 {
                    calls.fetch_add(1, Ordering::SeqCst);
                    return Err(HandlerError::fail("db unavailable"));
                }
                Ok(Outcome::Ack)
            }
        })
    };

    let sink = Arc::new(RecordingSink::default());
    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone()))
        .with_dead_letters(sink.clone())
        .build();
    let mut events = ingestor.bus().subscribe();
    ingestor.start().await.unwrap();
    let sub = ingestor.subscribe("orders", "w", handler).await.unwrap();

    eventually("both handled", || async { ingestor.last_acked(&sub).await == Some(2) }).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let letters = sink.letters.lock().unwrap().clone();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message.seq(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert!(letters[0].reason.contains("db unavailable"));

    let evs = events_until(&mut events, "ack of seq 2", |evs| {
        count(evs, "w", EventKind::MessageAcked) == 1
    })
    .await;
    assert_eq!(count(&evs, "w", EventKind::HandlerFailed), 3);
    assert_eq!(count(&evs, "w", EventKind::RedeliveryScheduled), 2);
    assert_eq!(count(&evs, "w", EventKind::DeadLettered), 1);
    assert_eq!(count(&evs, "w", EventKind::MessageAcked), 1);
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn nack_dead_letters_immediately_and_sink_failures_hold_position() {
    let net = MemoryBus::new();
    net.publish("orders", "");

    let sink = Arc::new(RecordingSink {
        refuse_first: AtomicU32::new(2),
        ..RecordingSink::default()
    });
    let handler: HandlerRef = HandlerFn::arc(|msg: Message, _ctx: CancellationToken| async move {
        if msg.payload().is_empty() {
            return Ok(Outcome::Nack);
        }
        Ok::<_, HandlerError>(Outcome::Ack)
    });

    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone()))
        .with_dead_letters(sink.clone())
        .build();
    let mut events = ingestor.bus().subscribe();
    ingestor.start().await.unwrap();
    let sub = ingestor.subscribe("orders", "w", handler).await.unwrap();

    eventually("dead-lettered", || async {
        ingestor.last_acked(&sub).await == Some(1) && net.acked("w") == 1
    })
    .await;

    let letters = sink.letters.lock().unwrap().clone();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 1);

    let evs = events_until(&mut events, "dead letter", |evs| {
        count(evs, "w", EventKind::DeadLettered) == 1
    })
    .await;
    assert_eq!(count(&evs, "w", EventKind::DeliveryStarting), 1);
    assert_eq!(count(&evs, "w", EventKind::DeadLetterFailed), 2);
    assert_eq!(count(&evs, "w", EventKind::DeadLettered), 1);
    assert_eq!(net.acks("w"), vec![1]);
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn slow_handler_times_out_without_delaying_other_subscriptions() {
    let net = MemoryBus::new();
    for i in 1..=3 {
        net.publish("orders", format!("{i}"));
        net.publish("payments", format!("{i}"));
    }

    let cfg = Config {
        handler_timeout: Duration::from_millis(100),
        max_attempts: 2,
        ..fast_config()
    };
    let sink = Arc::new(RecordingSink::default());
    let ingestor = Ingestor::builder(cfg, Arc::new(net.clone()))
        .with_dead_letters(sink.clone())
        .build();
    let mut events = ingestor.bus().subscribe();
    ingestor.start().await.unwrap();

    let stuck: HandlerRef = HandlerFn::arc(|msg: Message, ctx: CancellationToken| async move {
        if msg.seq() == 1 {
            ctx.cancelled().await;
            return Err(HandlerError::Canceled);
        }
        Ok(Outcome::Ack)
    });
    let seen: Seen = Arc::default();
    let slow = ingestor.subscribe("orders", "slow", stuck).await.unwrap();
    let fast = ingestor
        .subscribe("payments", "fast", recording_acker(&seen))
        .await
        .unwrap();

    eventually("fast subscription done", || async {
        ingestor.last_acked(&fast).await == Some(3)
    })
    .await;
    assert_eq!(ingestor.last_acked(&slow).await, Some(0));

    eventually("slow subscription done", || async {
        ingestor.last_acked(&slow).await == Some(3)
    })
    .await;

    let evs = events_until(&mut events, "slow dead letter", |evs| {
        count(evs, "slow", EventKind::DeadLettered) == 1
    })
    .await;
    assert_eq!(count(&evs, "slow", EventKind::TimeoutHit), 2);
    assert_eq!(count(&evs, "fast", EventKind::TimeoutHit), 0);
    assert_eq!(sink.letters.lock().unwrap().len(), 1);
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn bad_credentials_stop_the_manager() {
    let net = MemoryBus::new();
    net.require_secret("right");
    let cfg = fast_config().with_credentials(Credentials::new("svc", "wrong"));

    let ingestor = Ingestor::builder(cfg, Arc::new(net.clone())).build();
    let err = ingestor.start().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Unauthorized { .. }));
    assert_eq!(net.dials(), 1);
    assert!(matches!(
        ingestor.closed().await,
        Err(RuntimeError::Connection(ConnectionError::Unauthorized { .. }))
    ));
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_ceiling_is_fatal() {
    let net = MemoryBus::new();
    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    ingestor.start().await.unwrap();

    net.set_offline(true);
    net.drop_connections();

    match ingestor.closed().await {
        Err(RuntimeError::Connection(ConnectionError::Exhausted { attempts, .. })) => {
            assert_eq!(attempts, 5)
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(net.dials(), 6);
    assert_eq!(ingestor.state(), SessionState::Closed);
}

#[tokio::test]
async fn durable_names_are_exclusive() {
    let net = MemoryBus::new();
    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    ingestor.start().await.unwrap();

    let seen: Seen = Arc::default();
    let first = ingestor
        .subscribe("orders", "w", recording_acker(&seen))
        .await
        .unwrap();
    assert!(matches!(
        ingestor.subscribe("orders", "w", recording_acker(&seen)).await,
        Err(SubscriptionError::DurableConflict { .. })
    ));

    assert_eq!(ingestor.unsubscribe(&first).await, Ok(0));
    assert!(!net.is_bound("w"));
    assert!(ingestor.subscribe("orders", "w", recording_acker(&seen)).await.is_ok());
    ingestor.close().await.unwrap();
}

/// Ignores the requested start sequence, replaying the subject from the top.
struct Replaying(MemoryBus);

struct ReplayingConnection(Arc<dyn Connection>);

#[async_trait]
impl Connector for Replaying {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let inner = self.0.connect(endpoint, credentials).await?;
        Ok(Arc::new(ReplayingConnection(inner)))
    }
}

#[async_trait]
impl Connection for ReplayingConnection {
    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        _start_seq: u64,
    ) -> Result<Box<dyn MessageStream>, TransportError> {
        self.0.subscribe(subject, durable, 1).await
    }

    async fn ack(&self, subject: &str, durable: &str, seq: u64) -> Result<(), TransportError> {
        self.0.ack(subject, durable, seq).await
    }

    async fn disconnected(&self) -> TransportError {
        self.0.disconnected().await
    }

    async fn close(&self) {
        self.0.close().await
    }
}

#[tokio::test]
async fn replayed_messages_below_position_are_reacked_not_handled() {
    let net = MemoryBus::new();
    for i in 1..=3 {
        net.publish("orders", format!("{i}"));
    }
    let positions = Arc::new(MemoryPositionStore::new());
    positions.save("w", 2).await;

    let ingestor = Ingestor::builder(fast_config(), Arc::new(Replaying(net.clone())))
        .with_positions(positions.clone())
        .build();
    let mut events = ingestor.bus().subscribe();
    ingestor.start().await.unwrap();

    let seen: Seen = Arc::default();
    let sub = ingestor
        .subscribe("orders", "w", recording_acker(&seen))
        .await
        .unwrap();
    eventually("third ack", || async {
        ingestor.last_acked(&sub).await == Some(3) && net.acked("w") == 3
    })
    .await;

    assert_eq!(seqs(&seen), vec![3]);
    assert_eq!(net.acks("w"), vec![1, 2, 3]);
    assert_eq!(positions.load("w").await, 3);
    assert_eq!(count(&drain(&mut events), "w", EventKind::DuplicateSkipped), 2);
    ingestor.close().await.unwrap();
}

struct StallingStore;

#[async_trait]
impl PositionStore for StallingStore {
    async fn load(&self, _durable: &str) -> u64 {
        0
    }

    async fn save(&self, _durable: &str, _seq: u64) {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
}

#[tokio::test]
async fn close_reports_pumps_stuck_past_grace() {
    let net = MemoryBus::new();
    net.publish("orders", "1");

    let cfg = Config {
        grace: Duration::from_millis(50),
        ..fast_config()
    };
    let ingestor = Ingestor::builder(cfg, Arc::new(net.clone()))
        .with_positions(Arc::new(StallingStore))
        .build();
    let mut events = ingestor.bus().subscribe();
    ingestor.start().await.unwrap();

    let seen: Seen = Arc::default();
    let sub = ingestor
        .subscribe("orders", "w", recording_acker(&seen))
        .await
        .unwrap();
    eventually("handler ran", || async { seqs(&seen) == vec![1] }).await;

    match ingestor.close().await {
        Err(RuntimeError::GraceExceeded { stuck, .. }) => assert_eq!(stuck, vec!["w".to_string()]),
        other => panic!("expected grace exceeded, got {other:?}"),
    }
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| e.kind == EventKind::GraceExceeded)
    );

    // Stuck while persisting: neither the position nor the bus moved.
    assert_eq!(ingestor.last_acked(&sub).await, Some(0));
    assert!(net.acks("w").is_empty());
}

#[tokio::test]
async fn close_during_blocked_handler_keeps_position() {
    let net = MemoryBus::new();
    net.publish("orders", "1");
    net.publish("orders", "2");

    let entered = Arc::new(AtomicBool::new(false));
    let handler: HandlerRef = {
        let entered = Arc::clone(&entered);
        HandlerFn::arc(move |msg: Message, _ctx: CancellationToken| {
            let entered = Arc::clone(&entered);
            async move {
                if msg.seq() == 2 {
                    entered.store(true, Ordering::SeqCst);
                    std::future::pending::<()>().await;
                }
                Ok::<_, HandlerError>(Outcome::Ack)
            }
        })
    };

    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    ingestor.start().await.unwrap();
    let sub = ingestor.subscribe("orders", "w", handler).await.unwrap();

    eventually("handler blocked on seq 2", || async { entered.load(Ordering::SeqCst) }).await;
    ingestor.close().await.unwrap();

    assert_eq!(ingestor.last_acked(&sub).await, Some(1));
    assert_eq!(net.acks("w"), vec![1]);
    assert_eq!(ingestor.state(), SessionState::Closed);
}

#[tokio::test]
async fn subscription_made_while_disconnected_attaches_on_connect() {
    let net = MemoryBus::new();
    net.publish("orders", "1");

    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    let seen: Seen = Arc::default();
    let sub = ingestor
        .subscribe("orders", "w", recording_acker(&seen))
        .await
        .unwrap();
    assert_eq!(ingestor.subscriptions().await[0].session, None);
    assert!(!net.is_bound("w"));

    ingestor.start().await.unwrap();
    eventually("first ack", || async {
        ingestor.last_acked(&sub).await == Some(1) && net.acked("w") == 1
    })
    .await;
    assert_eq!(seqs(&seen), vec![1]);
    ingestor.close().await.unwrap();
}

#[tokio::test]
async fn subscribe_while_link_drops_is_kept_and_attached_later() {
    let net = MemoryBus::new();
    net.publish("orders", "1");

    let ingestor = Ingestor::builder(fast_config(), Arc::new(net.clone())).build();
    ingestor.start().await.unwrap();

    net.drop_connections();
    let seen: Seen = Arc::default();
    let sub = ingestor
        .subscribe("orders", "w", recording_acker(&seen))
        .await
        .expect("link failures are not subscription errors");
    assert_eq!(ingestor.subscriptions().await.len(), 1);

    eventually("acked after reconnect", || async {
        ingestor.last_acked(&sub).await == Some(1) && net.acked("w") == 1
    })
    .await;
    assert_eq!(seqs(&seen), vec![1]);
    ingestor.close().await.unwrap();
}

/// Fails `fail_next` subscribe calls with `Unreachable` while the link stays up.
struct FlakySubscribe {
    net: MemoryBus,
    fail_next: Arc<AtomicU32>,
}

struct FlakyConnection {
    inner: Arc<dyn Connection>,
    fail_next: Arc<AtomicU32>,
}

#[async_trait]
impl Connector for FlakySubscribe {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let inner = self.net.connect(endpoint, credentials).await?;
        Ok(Arc::new(FlakyConnection {
            inner,
            fail_next: Arc::clone(&self.fail_next),
        }))
    }
}

#[async_trait]
impl Connection for FlakyConnection {
    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
        start_seq: u64,
    ) -> Result<Box<dyn MessageStream>, TransportError> {
        let left = self.fail_next.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_next.store(left - 1, Ordering::SeqCst);
            return Err(TransportError::Unreachable("subscribe timed out".into()));
        }
        self.inner.subscribe(subject, durable, start_seq).await
    }

    async fn ack(&self, subject: &str, durable: &str, seq: u64) -> Result<(), TransportError> {
        self.inner.ack(subject, durable, seq).await
    }

    async fn disconnected(&self) -> TransportError {
        self.inner.disconnected().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn failed_restore_is_retried_on_the_same_session() {
    let net = MemoryBus::new();
    net.publish("orders", "1");
    let fail_next = Arc::new(AtomicU32::new(0));
    let connector = FlakySubscribe {
        net: net.clone(),
        fail_next: Arc::clone(&fail_next),
    };

    let ingestor = Ingestor::builder(fast_config(), Arc::new(connector)).build();
    let mut events = ingestor.bus().subscribe();
    ingestor.start().await.unwrap();
    let seen: Seen = Arc::default();
    let sub = ingestor
        .subscribe("orders", "w", recording_acker(&seen))
        .await
        .unwrap();
    eventually("first ack", || async {
        ingestor.last_acked(&sub).await == Some(1) && net.acked("w") == 1
    })
    .await;

    fail_next.store(1, Ordering::SeqCst);
    net.drop_connections();
    let evs = events_until(&mut events, "failed restore", |evs| {
        count(evs, "w", EventKind::SubscriptionFailed) >= 1
    })
    .await;
    let failed_on = evs
        .iter()
        .find(|e| e.kind == EventKind::SubscriptionFailed)
        .and_then(|e| e.session);

    net.publish("orders", "2");
    eventually("second ack", || async {
        ingestor.last_acked(&sub).await == Some(2) && net.acked("w") == 2
    })
    .await;

    assert_eq!(seqs(&seen), vec![1, 2]);
    assert_eq!(ingestor.subscriptions().await[0].session, failed_on);
    ingestor.close().await.unwrap();
}
