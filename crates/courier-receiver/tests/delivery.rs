mod common;

use bytes::Bytes;
use common::{TOPIC, body, builder, eventually, loopback, publish, started, within};
use courier_receiver::{InboundMessage, ReceiverError};
use courier_transport::Metric;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn receive_requires_a_started_receiver() {
    let (_loopback, transport) = loopback();
    let receiver = builder(transport).build().expect("build");
    assert!(matches!(
        receiver.receive_message(Some(Duration::from_millis(1))).await,
        Err(ReceiverError::IllegalState(_))
    ));
}

#[tokio::test]
async fn receive_times_out_on_an_empty_buffer() {
    let (_loopback, receiver) = started(4).await;
    let err = receiver
        .receive_message(Some(Duration::from_millis(20)))
        .await
        .expect_err("nothing buffered");
    assert!(matches!(err, ReceiverError::Timeout(_)));
}

#[tokio::test]
async fn pull_receive_preserves_order() {
    let (loopback, receiver) = started(8).await;
    publish(&loopback, 5);
    for n in 0..5 {
        let message = receiver
            .receive_message(Some(Duration::from_secs(1)))
            .await
            .expect("message");
        assert_eq!(message.topic(), TOPIC);
        assert_eq!(body(message.payload()), format!("m-{n}"));
        assert!(!message.has_discard_indication());
    }
}

#[tokio::test]
async fn drop_oldest_tags_the_first_survivor() {
    let (loopback, receiver) = started(3).await;
    publish(&loopback, 5);
    let mut received = Vec::new();
    for _ in 0..3 {
        let message = receiver
            .receive_message(Some(Duration::from_secs(1)))
            .await
            .expect("message");
        received.push((body(message.payload()), message.has_discard_indication()));
    }
    assert_eq!(
        received,
        vec![
            ("m-2".to_string(), true),
            ("m-3".to_string(), false),
            ("m-4".to_string(), false),
        ]
    );
    assert_eq!(
        loopback.metric(Metric::ReceivedMessagesBackpressureDiscarded),
        2
    );
    assert_eq!(loopback.metric(Metric::InternalDiscardNotifications), 1);
}

#[tokio::test]
async fn drop_latest_keeps_the_buffer_and_tags_the_next_arrival() {
    let (loopback, transport) = loopback();
    let receiver = builder(transport)
        .on_back_pressure_drop_latest(2)
        .build()
        .expect("build");
    receiver.start().await.expect("start");
    publish(&loopback, 4);
    assert_eq!(receiver.buffered(), 2);
    for expected in ["m-0", "m-1"] {
        let message = receiver
            .receive_message(Some(Duration::from_secs(1)))
            .await
            .expect("message");
        assert_eq!(body(message.payload()), expected);
        assert!(!message.has_discard_indication());
    }
    loopback.deliver(TOPIC, Bytes::from_static(b"after-loss"));
    let message = receiver
        .receive_message(Some(Duration::from_secs(1)))
        .await
        .expect("message");
    assert_eq!(body(message.payload()), "after-loss");
    assert!(message.has_discard_indication());
    assert_eq!(
        loopback.metric(Metric::ReceivedMessagesBackpressureDiscarded),
        2
    );
}

#[tokio::test]
async fn immediate_terminate_reports_every_queued_message() {
    let (loopback, receiver) = started(50).await;
    publish(&loopback, 7);
    let err = receiver
        .terminate(Some(Duration::ZERO))
        .await
        .expect_err("messages were still queued");
    assert!(matches!(
        err,
        ReceiverError::IncompleteDelivery { undelivered: 7 }
    ));
    assert_eq!(
        loopback.metric(Metric::ReceivedMessagesTerminationDiscarded),
        7
    );
    assert_eq!(receiver.buffered(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbounded_terminate_waits_for_a_slow_consumer() {
    let (loopback, receiver) = started(50).await;
    let delivered = Arc::new(Mutex::new(Vec::new()));
    publish(&loopback, 20);
    {
        let delivered = Arc::clone(&delivered);
        receiver
            .receive_async(Arc::new(move |message: InboundMessage| {
                std::thread::sleep(Duration::from_millis(5));
                delivered.lock().push(body(message.payload()));
            }))
            .expect("handler");
    }
    within(receiver.terminate(None)).await.expect("clean terminate");
    let delivered = delivered.lock().clone();
    let expected: Vec<String> = (0..20).map(|n| format!("m-{n}")).collect();
    assert_eq!(delivered, expected);
    assert_eq!(
        loopback.metric(Metric::ReceivedMessagesTerminationDiscarded),
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grace_period_lets_a_pull_consumer_drain() {
    let (loopback, receiver) = started(50).await;
    publish(&loopback, 10);
    let consumer = {
        let receiver = receiver.clone();
        tokio::spawn(async move {
            let mut received = 0;
            while receiver.receive_message(None).await.is_ok() {
                received += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            received
        })
    };
    within(receiver.terminate(Some(Duration::from_secs(5))))
        .await
        .expect("drained within grace period");
    assert_eq!(within(consumer).await.expect("join"), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_grace_period_discards_the_rest() {
    let (loopback, receiver) = started(50).await;
    let delivered = Arc::new(AtomicUsize::new(0));
    publish(&loopback, 30);
    {
        let delivered = Arc::clone(&delivered);
        receiver
            .receive_async(Arc::new(move |_message: InboundMessage| {
                std::thread::sleep(Duration::from_millis(20));
                delivered.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("handler");
    }
    let err = within(receiver.terminate(Some(Duration::from_millis(50))))
        .await
        .expect_err("grace period too short");
    let ReceiverError::IncompleteDelivery { undelivered } = err else {
        panic!("unexpected error: {err}");
    };
    let delivered = delivered.load(Ordering::SeqCst) as u64;
    assert!(undelivered > 0);
    assert_eq!(delivered + undelivered, 30);
}

#[tokio::test]
async fn handler_panic_does_not_stop_delivery() {
    let (loopback, receiver) = started(8).await;
    let delivered = Arc::new(AtomicUsize::new(0));
    {
        let delivered = Arc::clone(&delivered);
        receiver
            .receive_async(Arc::new(move |message: InboundMessage| {
                delivered.fetch_add(1, Ordering::SeqCst);
                if body(message.payload()) == "m-0" {
                    panic!("application bug");
                }
            }))
            .expect("handler");
    }
    publish(&loopback, 3);
    eventually(|| delivered.load(Ordering::SeqCst) == 3).await;
    receiver.terminate(None).await.expect("terminate");
}

#[tokio::test]
async fn receive_after_termination_is_illegal() {
    let (_loopback, receiver) = started(8).await;
    receiver.terminate(None).await.expect("terminate");
    assert!(matches!(
        receiver.receive_message(None).await,
        Err(ReceiverError::IllegalState(_))
    ));
    assert!(matches!(
        receiver.receive_async(Arc::new(|_message: InboundMessage| {})),
        Err(ReceiverError::IllegalState(_))
    ));
}

#[tokio::test]
async fn blocked_receive_wakes_on_termination() {
    let (_loopback, receiver) = started(8).await;
    let waiting = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive_message(None).await })
    };
    tokio::task::yield_now().await;
    receiver.terminate(None).await.expect("terminate");
    let result = within(waiting).await.expect("join");
    assert!(matches!(result, Err(ReceiverError::IllegalState(_))));
}
