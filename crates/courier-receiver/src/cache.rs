//! Cache request registry.
//!
//! Tracks cache requests that were sent but not yet answered, keyed by the
//! transport-assigned [`CacheRequestIndex`]. The transport reports completions
//! on its own thread; the send-time callback forwards each one onto a bounded
//! channel that a per-receiver poller drains. The channel and poller are
//! created on the first submission.
//!
//! A submission holds the resource lock from admission until the request is
//! sent, and teardown claims the same lock before cancelling, so no request is
//! registered behind teardown's back. The outstanding counter is released by
//! the poller *before* the response processor runs, so a slow processor does
//! not hold back new submissions.
use courier_transport::{
    CacheEventCallback, CacheEventInfo, CacheRequest, CacheRequestId, CacheRequestIndex,
    CacheResponse, CachedMessageSubscriptionRequest, DispatchToken, Transport,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::MAX_OUTSTANDING_CACHE_REQUESTS;
use crate::error::{ReceiverError, Result};
use crate::lifecycle::Lifecycle;

/// Application callback for `request_cached_async_with_callback`.
pub type CacheResponseCallback = Arc<dyn Fn(CacheResponse) + Send + Sync>;

pub(crate) enum ResponseProcessor {
    Channel(oneshot::Sender<CacheResponse>),
    Callback(CacheResponseCallback),
}

impl ResponseProcessor {
    fn process(self, response: CacheResponse) {
        match self {
            ResponseProcessor::Channel(tx) => {
                if tx.send(response).is_err() {
                    debug!("cache response receiver dropped");
                }
            }
            ResponseProcessor::Callback(callback) => callback(response),
        }
    }
}

struct CacheRequestEntry {
    request: CacheRequest,
    processor: ResponseProcessor,
}

type Entries = Arc<Mutex<HashMap<CacheRequestIndex, CacheRequestEntry>>>;
type EventSender = Arc<Mutex<Option<mpsc::Sender<CacheEventInfo>>>>;

struct Poller {
    task: JoinHandle<()>,
}

pub(crate) struct CacheRegistry {
    outstanding: Arc<AtomicUsize>,
    entries: Entries,
    sender: EventSender,
    // Resource lock: admission check plus lazy poller creation.
    resources: Mutex<Option<Poller>>,
}

impl CacheRegistry {
    pub(crate) fn new() -> Self {
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            entries: Arc::new(Mutex::new(HashMap::new())),
            sender: Arc::new(Mutex::new(None)),
            resources: Mutex::new(None),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    /// Admits, registers and sends one cache request.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit(
        &self,
        lifecycle: &Lifecycle,
        runtime: &Handle,
        transport: &Arc<dyn Transport>,
        token: DispatchToken,
        config: &CachedMessageSubscriptionRequest,
        id: CacheRequestId,
        processor: ResponseProcessor,
    ) -> Result<()> {
        // Held through send: teardown takes this lock first, so every admitted
        // request is registered before teardown snapshots the entries.
        let mut resources = self.resources.lock();
        if !lifecycle.is_running() {
            return Err(ReceiverError::illegal_state(
                "cache requests require a started receiver",
            ));
        }
        if !transport.is_running() {
            return Err(ReceiverError::illegal_state(
                "cache requests require a running transport",
            ));
        }
        if self.outstanding.load(Ordering::SeqCst) >= MAX_OUTSTANDING_CACHE_REQUESTS {
            return Err(ReceiverError::IllegalState(format!(
                "too many outstanding cache requests (limit {MAX_OUTSTANDING_CACHE_REQUESTS})"
            )));
        }
        let current = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("courier_receiver_cache_outstanding").set(current as f64);
        if resources.is_none() {
            *resources = Some(self.start_poller(runtime, transport));
        }

        let requestor = transport.cache_requestor();
        let request = match requestor.create_cache_request(config, id, token) {
            Ok(request) => request,
            Err(err) => {
                self.release();
                return Err(err.into());
            }
        };

        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&request.index) {
                drop(entries);
                error!(
                    index = request.index.0,
                    "transport reused an in-flight cache request index"
                );
                self.release();
                return Err(ReceiverError::IllegalState(format!(
                    "cache request index {} is already registered",
                    request.index.0
                )));
            }
            entries.insert(
                request.index,
                CacheRequestEntry {
                    request: request.clone(),
                    processor,
                },
            );
        }

        if let Err(err) = requestor.send_cache_request(&request, self.forwarder(), token) {
            self.entries.lock().remove(&request.index);
            self.release();
            if let Err(destroy) = requestor.destroy_cache_request(&request) {
                warn!(index = request.index.0, error = %destroy, "failed to destroy unsent cache request");
            }
            return Err(err.into());
        }
        drop(resources);
        metrics::counter!("courier_receiver_cache_requests_total").increment(1);
        debug!(index = request.index.0, id = id.0, topic = %config.topic, "cache request sent");
        Ok(())
    }

    fn start_poller(&self, runtime: &Handle, transport: &Arc<dyn Transport>) -> Poller {
        let (tx, rx) = mpsc::channel(MAX_OUTSTANDING_CACHE_REQUESTS);
        *self.sender.lock() = Some(tx);
        let task = runtime.spawn(poll_responses(
            rx,
            Arc::clone(&self.outstanding),
            Arc::clone(&self.entries),
            Arc::clone(transport),
        ));
        debug!("cache response poller started");
        Poller { task }
    }

    fn forwarder(&self) -> CacheEventCallback {
        let sender = Arc::clone(&self.sender);
        Arc::new(move |event: CacheEventInfo| {
            let tx = sender.lock().clone();
            match tx {
                Some(tx) => {
                    if let Err(err) = tx.try_send(event) {
                        warn!(error = %err, "failed to forward cache response");
                    }
                }
                None => debug!(index = event.index.0, "cache response after teardown"),
            }
        })
    }

    fn release(&self) {
        let current = release(&self.outstanding);
        metrics::gauge!("courier_receiver_cache_outstanding").set(current as f64);
    }

    /// Cancels everything still registered and stops the poller.
    pub(crate) async fn teardown(&self, transport: &dyn Transport) {
        let poller = self.resources.lock().take();
        let Some(poller) = poller else {
            return;
        };
        let requests: Vec<CacheRequest> = self
            .entries
            .lock()
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        let sender = self.sender.lock().clone();
        for request in requests {
            let Some(event) = transport
                .cache_requestor()
                .cancel_pending_cache_requests(&request)
            else {
                continue;
            };
            if let Some(tx) = &sender
                && tx.send(event).await.is_err()
            {
                warn!(index = request.index.0, "cache poller gone before cancellation");
            }
        }
        drop(sender);
        self.sender.lock().take();
        if let Err(err) = poller.task.await {
            warn!(error = %err, "cache poller task failed");
        }
        let abandoned = std::mem::take(&mut *self.entries.lock());
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "dropping unanswered cache requests");
        }
        debug!("cache resources torn down");
    }
}

fn release(outstanding: &AtomicUsize) -> usize {
    let mut current = outstanding.load(Ordering::SeqCst);
    while current > 0 {
        match outstanding.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => return current - 1,
            Err(actual) => current = actual,
        }
    }
    0
}

async fn poll_responses(
    mut rx: mpsc::Receiver<CacheEventInfo>,
    outstanding: Arc<AtomicUsize>,
    entries: Entries,
    transport: Arc<dyn Transport>,
) {
    while let Some(event) = rx.recv().await {
        let current = release(&outstanding);
        metrics::gauge!("courier_receiver_cache_outstanding").set(current as f64);
        let entry = entries.lock().remove(&event.index);
        let Some(entry) = entry else {
            warn!(index = event.index.0, "cache response for unknown request");
            continue;
        };
        let response = transport
            .cache_requestor()
            .process_cache_event(&entry.request, event);
        debug!(
            id = response.request_id.0,
            outcome = ?response.outcome,
            "cache request completed"
        );
        let processor = entry.processor;
        if catch_unwind(AssertUnwindSafe(|| processor.process(response))).is_err() {
            metrics::counter!("courier_receiver_callback_panics_total").increment(1);
            warn!("cache response callback panicked");
        }
    }
    debug!("cache response poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Transition;
    use courier_transport::{CacheOutcome, LoopbackTransport, TransportError};
    use tokio::time::{Duration, timeout};

    fn cache_request() -> CachedMessageSubscriptionRequest {
        CachedMessageSubscriptionRequest::as_available("cache", "prices/eu")
    }

    fn channel_processor() -> (ResponseProcessor, oneshot::Receiver<CacheResponse>) {
        let (tx, rx) = oneshot::channel();
        (ResponseProcessor::Channel(tx), rx)
    }

    fn setup() -> (Arc<LoopbackTransport>, Arc<dyn Transport>, CacheRegistry) {
        let loopback = Arc::new(LoopbackTransport::new());
        let transport: Arc<dyn Transport> = loopback.clone();
        (loopback, transport, CacheRegistry::new())
    }

    fn started() -> Lifecycle {
        let lifecycle = Lifecycle::new();
        assert!(matches!(lifecycle.begin_start(true), Transition::Proceed));
        lifecycle.finish_start(Ok(()));
        lifecycle
    }

    #[tokio::test]
    async fn response_resolves_channel_and_clears_entry() {
        let (loopback, transport, registry) = setup();
        let lifecycle = started();
        let (processor, rx) = channel_processor();
        registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(7),
                processor,
            )
            .expect("submit");
        assert_eq!(registry.outstanding(), 1);
        let index = loopback.cache().pending()[0];
        assert!(loopback
            .cache()
            .respond_to_cache_request(index, CacheOutcome::Ok));
        let response = timeout(Duration::from_secs(1), rx)
            .await
            .expect("response in time")
            .expect("response");
        assert_eq!(response.request_id, CacheRequestId(7));
        assert_eq!(response.outcome, CacheOutcome::Ok);
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn rejected_when_not_started_without_touching_transport() {
        let (loopback, transport, registry) = setup();
        let lifecycle = started();
        let (processor, _rx) = channel_processor();
        let err = registry
            .submit(
                &Lifecycle::new(),
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(1),
                processor,
            )
            .expect_err("not started");
        assert!(matches!(err, ReceiverError::IllegalState(_)));
        assert_eq!(loopback.cache().created(), 0);

        loopback.set_running(false);
        let (processor, _rx) = channel_processor();
        let err = registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(1),
                processor,
            )
            .expect_err("transport down");
        assert!(matches!(err, ReceiverError::IllegalState(_)));
        assert_eq!(loopback.cache().created(), 0);
    }

    #[tokio::test]
    async fn duplicate_index_is_rejected_and_rolled_back() {
        let (loopback, transport, registry) = setup();
        let lifecycle = started();
        loopback.cache().force_index(Some(CacheRequestIndex(42)));
        let (first, _rx1) = channel_processor();
        registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(1),
                first,
            )
            .expect("first submit");
        let (second, _rx2) = channel_processor();
        let err = registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(2),
                second,
            )
            .expect_err("duplicate index");
        assert!(matches!(err, ReceiverError::IllegalState(_)));
        assert_eq!(registry.outstanding(), 1);
        assert_eq!(registry.pending(), 1);
        assert_eq!(loopback.cache().sent(), 1);
    }

    #[tokio::test]
    async fn send_failure_rolls_back_and_destroys() {
        let (loopback, transport, registry) = setup();
        let lifecycle = started();
        loopback
            .cache()
            .fail_next_send(TransportError::failed("cache session refused"));
        let (processor, _rx) = channel_processor();
        let err = registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(3),
                processor,
            )
            .expect_err("send failure");
        assert!(matches!(err, ReceiverError::Native(_)));
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(registry.pending(), 0);
        assert_eq!(loopback.cache().destroyed(), 1);
    }

    #[tokio::test]
    async fn teardown_resolves_pending_requests_as_cancelled() {
        // Both cancellation styles: reported through the send-time callback,
        // and handed back for the registry to route itself.
        for synthesizes in [false, true] {
            let (loopback, transport, registry) = setup();
            let lifecycle = started();
            loopback.cache().set_cancel_synthesizes(synthesizes);
            let mut receivers = Vec::new();
            for id in 1..=3 {
                let (processor, rx) = channel_processor();
                registry
                    .submit(
                        &lifecycle,
                        &Handle::current(),
                        &transport,
                        DispatchToken(1),
                        &cache_request(),
                        CacheRequestId(id),
                        processor,
                    )
                    .expect("submit");
                receivers.push(rx);
            }

            timeout(Duration::from_secs(1), registry.teardown(transport.as_ref()))
                .await
                .expect("teardown finished");

            for rx in receivers {
                let response = rx.await.expect("cancellation delivered");
                assert_eq!(response.outcome, CacheOutcome::Cancelled);
            }
            assert_eq!(registry.pending(), 0);
            assert_eq!(registry.outstanding(), 0);
            assert!(loopback.cache().pending().is_empty());
        }
    }

    #[tokio::test]
    async fn callback_processor_panic_is_contained() {
        let (loopback, transport, registry) = setup();
        let lifecycle = started();
        let callback: CacheResponseCallback = Arc::new(|_response| panic!("callback failure"));
        registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(1),
                ResponseProcessor::Callback(callback),
            )
            .expect("submit");
        let (processor, rx) = channel_processor();
        registry
            .submit(
                &lifecycle,
                &Handle::current(),
                &transport,
                DispatchToken(1),
                &cache_request(),
                CacheRequestId(2),
                processor,
            )
            .expect("submit");
        for index in loopback.cache().pending() {
            loopback
                .cache()
                .respond_to_cache_request(index, CacheOutcome::NoData);
        }
        let response = timeout(Duration::from_secs(1), rx)
            .await
            .expect("in time")
            .expect("response");
        assert_eq!(response.outcome, CacheOutcome::NoData);
    }

    #[test]
    fn release_never_underflows() {
        let counter = AtomicUsize::new(1);
        assert_eq!(release(&counter), 0);
        assert_eq!(release(&counter), 0);
    }
}
