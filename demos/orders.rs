//! # Example: order ingestion
//!
//! Publishes a batch of orders on an in-process bus and consumes them with a
//! durable subscription. One order is malformed and gets dead-lettered; one
//! fails transiently and succeeds on its second attempt.
//!
//! Run with `RUST_LOG=busvisor=debug cargo run --example orders`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use busvisor::transport::memory::MemoryBus;
use busvisor::{
    Config, HandlerError, HandlerFn, HandlerRef, Ingestor, LogWriter, Message, Outcome,
    Subscribe,
};

fn order_handler() -> HandlerRef {
    let flaky_once = Arc::new(AtomicBool::new(true));
    HandlerFn::arc(move |msg: Message, _ctx: CancellationToken| {
        let flaky_once = Arc::clone(&flaky_once);
        async move {
            let body = std::str::from_utf8(msg.payload())
                .map_err(|e| HandlerError::fatal(format!("not utf-8: {e}")))?;

            if !body.starts_with('{') {
                return Ok(Outcome::Nack);
            }
            if msg.seq() == 3 && flaky_once.swap(false, Ordering::SeqCst) {
                return Err(HandlerError::fail("inventory service busy"));
            }

            println!("[orders] #{} attempt {} {}", msg.seq(), msg.attempt(), body);
            Ok(Outcome::Ack)
        }
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("busvisor=info")))
        .init();

    let net = MemoryBus::new();
    net.publish("orders", r#"{"id":1,"sku":"A-100"}"#);
    net.publish("orders", r#"{"id":2,"sku":"B-200"}"#);
    net.publish("orders", r#"{"id":3,"sku":"C-300"}"#);
    net.publish("orders", "garbage");
    net.publish("orders", r#"{"id":5,"sku":"E-500"}"#);

    let mut cfg = Config::new("mem://local");
    cfg.handler_timeout = Duration::from_secs(2);
    cfg.redelivery = busvisor::BackoffPolicy::fixed(Duration::from_millis(100));

    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let ingestor = Ingestor::builder(cfg, Arc::new(net.clone()))
        .with_subscribers(subs)
        .build();

    ingestor.start().await?;
    let sub = ingestor
        .subscribe("orders", "orders-worker", order_handler())
        .await?;

    while ingestor.last_acked(&sub).await < Some(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("[orders] last acked {:?}", ingestor.last_acked(&sub).await);

    ingestor.close().await?;
    Ok(())
}
