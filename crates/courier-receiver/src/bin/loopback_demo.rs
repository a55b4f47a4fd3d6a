// Loopback demo: drives a receiver end to end without a broker.
//
// Publishes a burst larger than the buffer into a loopback transport, drains
// it through a push handler, issues a cache request, then terminates.
use anyhow::{Context, Result};
use bytes::Bytes;
use courier_receiver::{
    DirectReceiverBuilder, InboundMessage, ReceiverConfig, Subscription, TerminationEvent,
};
use courier_transport::{
    CacheOutcome, CacheRequestId, CachedMessageSubscriptionRequest, LoopbackTransport, Transport,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ReceiverConfig::from_env_or_yaml(None)?;
    tracing::info!(
        backpressure = config.backpressure.as_str(),
        buffer_capacity = config.buffer_capacity,
        "starting loopback demo"
    );

    let loopback = Arc::new(LoopbackTransport::new());
    let transport: Arc<dyn Transport> = loopback.clone();
    let receiver = DirectReceiverBuilder::new(transport)
        .from_config(&config)
        .with_subscriptions([Subscription::topic("demo/prices")])
        .build()?;
    receiver.set_termination_listener(Arc::new(|event: &TerminationEvent| {
        tracing::info!(%event, "receiver terminated");
    }));
    receiver.start().await?;

    // Burst before any handler exists so overflow is visible.
    let burst = config.buffer_capacity * 2;
    for n in 0..burst {
        loopback.deliver("demo/prices", Bytes::from(format!("tick-{n}")));
    }

    let delivered = Arc::new(AtomicUsize::new(0));
    let discards = Arc::new(AtomicUsize::new(0));
    {
        let delivered = Arc::clone(&delivered);
        let discards = Arc::clone(&discards);
        receiver.receive_async(Arc::new(move |message: InboundMessage| {
            delivered.fetch_add(1, Ordering::Relaxed);
            if message.has_discard_indication() {
                discards.fetch_add(1, Ordering::Relaxed);
                tracing::info!(topic = message.topic(), "messages were dropped before this one");
            }
        }))?;
    }

    let response = receiver.request_cached_async(
        &CachedMessageSubscriptionRequest::as_available("demo-cache", "demo/prices"),
        CacheRequestId(1),
    )?;
    for index in loopback.cache().pending() {
        loopback.cache().respond_to_cache_request(index, CacheOutcome::NoData);
    }
    let response = tokio::time::timeout(Duration::from_secs(1), response)
        .await
        .context("cache response timed out")?
        .context("cache response dropped")?;
    tracing::info!(outcome = ?response.outcome, "cache request completed");

    receiver.terminate(None).await?;
    tracing::info!(
        published = burst,
        delivered = delivered.load(Ordering::Relaxed),
        discard_indications = discards.load(Ordering::Relaxed),
        "demo finished"
    );
    Ok(())
}
