#![allow(dead_code)]

use bytes::Bytes;
use courier_receiver::{DirectMessageReceiver, DirectReceiverBuilder, Subscription};
use courier_transport::{LoopbackTransport, Transport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "market/eu/prices";

pub fn loopback() -> (Arc<LoopbackTransport>, Arc<dyn Transport>) {
    let loopback = Arc::new(LoopbackTransport::new());
    let transport: Arc<dyn Transport> = loopback.clone();
    (loopback, transport)
}

pub fn builder(transport: Arc<dyn Transport>) -> DirectReceiverBuilder {
    DirectReceiverBuilder::new(transport).with_subscriptions([Subscription::topic(TOPIC)])
}

pub async fn started(capacity: usize) -> (Arc<LoopbackTransport>, DirectMessageReceiver) {
    let (loopback, transport) = loopback();
    let receiver = builder(transport)
        .on_back_pressure_drop_oldest(capacity)
        .build()
        .expect("build");
    receiver.start().await.expect("start");
    (loopback, receiver)
}

pub fn publish(loopback: &LoopbackTransport, count: usize) {
    for n in 0..count {
        loopback.deliver(TOPIC, Bytes::from(format!("m-{n}")));
    }
}

pub fn body(payload: &Bytes) -> String {
    String::from_utf8(payload.to_vec()).expect("utf8")
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("completed in time")
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}
