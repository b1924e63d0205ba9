//! # Example: surviving connection loss
//!
//! A producer keeps publishing while the bus drops every connection twice.
//! The subscription is restored on each new session and resumes right after
//! the last acknowledged sequence: no gaps, no reordering. A message whose
//! handler was interrupted by the drop is handled again.
//!
//! Run with `RUST_LOG=busvisor=debug cargo run --example reconnect`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use busvisor::transport::memory::MemoryBus;
use busvisor::{
    BackoffPolicy, Config, HandlerError, HandlerFn, Ingestor, JitterPolicy, LogWriter, Message,
    Outcome, Subscribe,
};

const TOTAL: u64 = 30;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("busvisor=info")))
        .init();

    let net = MemoryBus::new();
    let cfg = Config {
        reconnect: BackoffPolicy {
            initial: Duration::from_millis(50),
            cap: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: JitterPolicy::Equal,
        },
        reconnect_ceiling: 0,
        ..Config::new("mem://local")
    };

    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let ingestor = Ingestor::builder(cfg, Arc::new(net.clone()))
        .with_subscribers(subs)
        .build();
    ingestor.manager().on_disconnect(|reason| {
        println!("[reconnect] lost connection: {reason}");
    });
    ingestor.start().await?;

    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handled);
    let handler = HandlerFn::arc(move |msg: Message, _ctx: CancellationToken| {
        let sink = Arc::clone(&sink);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(mut seen) = sink.lock() {
                seen.push(msg.seq());
            }
            Ok::<_, HandlerError>(Outcome::Ack)
        }
    });
    let sub = ingestor.subscribe("telemetry", "telemetry-worker", handler).await?;

    let producer = {
        let net = net.clone();
        tokio::spawn(async move {
            for i in 1..=TOTAL {
                net.publish("telemetry", format!("reading-{i}"));
                if i % 10 == 0 {
                    net.refuse_connections(2);
                    net.drop_connections();
                }
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        })
    };
    producer.await?;

    while ingestor.last_acked(&sub).await < Some(TOTAL) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let handled = handled.lock().map(|v| v.clone()).unwrap_or_default();
    let in_order = handled.windows(2).all(|w| w[0] < w[1]);
    println!(
        "[reconnect] handled {} messages, in order: {in_order}, dials: {}",
        handled.len(),
        net.dials()
    );

    ingestor.close().await?;
    Ok(())
}
