// In-process transport for tests and demos.
//
// Behaves like a session that is always connected: subscriptions confirm
// immediately unless a test holds them open, deliveries are pushed synchronously into every callback whose
// token holds a matching subscription, and cache requests stay pending until
// the caller answers them with `respond_to_cache_request`. Failure injection
// hooks let tests drive the receiver through its error paths.
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::{
    CacheEventCallback, CacheEventInfo, CacheOutcome, CacheRequest, CacheRequestId,
    CacheRequestIndex, CacheRequestor, CacheResponse, CachedMessageSubscriptionRequest,
};
use crate::events::{EventHandler, Events, HandlerId, SessionEvent, SessionEventKind};
use crate::{
    DispatchToken, InboundPayload, Metric, RxCallback, SubscriptionConfirm,
    SubscriptionCorrelationId, SubscriptionEvent, Transport, TransportError,
};

const SHARE_PREFIX: &str = "#share/";

type HeldConfirm = (SubscriptionCorrelationId, oneshot::Sender<SubscriptionEvent>);

/// Transport double that keeps everything in process.
///
/// ```
/// use bytes::Bytes;
/// use courier_transport::{DispatchToken, LoopbackTransport, Transport};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let transport = LoopbackTransport::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// let token = transport.register_callback(Arc::new(move |_payload| {
///     counter.fetch_add(1, Ordering::Relaxed);
///     true
/// }));
/// let _ = transport.subscribe("orders/eu", token).expect("subscribe");
/// assert_eq!(transport.deliver("orders/eu", Bytes::from_static(b"o-1")), 1);
/// assert_eq!(seen.load(Ordering::Relaxed), 1);
/// ```
pub struct LoopbackTransport {
    running: AtomicBool,
    next_id: AtomicU64,
    callbacks: DashMap<DispatchToken, RxCallback>,
    subscriptions: Mutex<Vec<(String, DispatchToken)>>,
    subscribe_failures: Mutex<HashMap<String, TransportError>>,
    confirm_failures: Mutex<HashMap<String, TransportError>>,
    confirm_holds: Mutex<HashSet<String>>,
    held_confirms: Mutex<HashMap<String, HeldConfirm>>,
    subscribe_calls: AtomicU64,
    unsubscribe_failures: Mutex<HashMap<String, TransportError>>,
    metrics: DashMap<Metric, u64>,
    events: LoopbackEvents,
    cache: LoopbackCacheRequestor,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            callbacks: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
            subscribe_failures: Mutex::new(HashMap::new()),
            confirm_failures: Mutex::new(HashMap::new()),
            confirm_holds: Mutex::new(HashSet::new()),
            held_confirms: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicU64::new(0),
            unsubscribe_failures: Mutex::new(HashMap::new()),
            metrics: DashMap::new(),
            events: LoopbackEvents::default(),
            cache: LoopbackCacheRequestor::default(),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Pushes a payload into every callback subscribed to `topic`. Returns how many retained it.
    pub fn deliver(&self, topic: &str, payload: Bytes) -> usize {
        let mut tokens: Vec<DispatchToken> = Vec::new();
        for (filter, token) in self.subscriptions.lock().iter() {
            if strip_share(filter) == topic && !tokens.contains(token) {
                tokens.push(*token);
            }
        }
        let mut accepted = 0;
        for token in tokens {
            // Clone out of the map so the callback never runs under a shard lock.
            let callback = match self.callbacks.get(&token) {
                Some(entry) => entry.value().clone(),
                None => continue,
            };
            if callback(InboundPayload::new(topic, payload.clone())) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Raises a session event on every handler registered for its kind.
    pub fn emit(&self, event: SessionEvent) {
        self.events.emit(&event);
    }

    pub fn metric(&self, metric: Metric) -> u64 {
        self.metrics.get(&metric).map(|value| *value).unwrap_or(0)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn registered_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub fn registered_handlers(&self) -> usize {
        self.events.handlers.len()
    }

    /// Makes the next subscribe call for `topic` fail synchronously.
    pub fn fail_subscribe(&self, topic: &str, error: TransportError) {
        self.subscribe_failures
            .lock()
            .insert(topic.to_string(), error);
    }

    /// Accepts the next subscribe call for `topic` but confirms it with an error.
    pub fn fail_subscribe_confirm(&self, topic: &str, error: TransportError) {
        self.confirm_failures.lock().insert(topic.to_string(), error);
    }

    /// Accepts the next subscribe call for `topic` but leaves its confirmation
    /// open until `release_subscribe_confirm`.
    pub fn hold_subscribe_confirm(&self, topic: &str) {
        self.confirm_holds.lock().insert(topic.to_string());
    }

    /// Confirms a held subscription. False when nothing is held for `topic`.
    pub fn release_subscribe_confirm(&self, topic: &str) -> bool {
        let Some((id, tx)) = self.held_confirms.lock().remove(topic) else {
            return false;
        };
        let _ = tx.send(SubscriptionEvent::confirmed(id));
        true
    }

    /// Number of subscribe calls that reached the transport.
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn fail_unsubscribe(&self, topic: &str, error: TransportError) {
        self.unsubscribe_failures
            .lock()
            .insert(topic.to_string(), error);
    }

    pub fn cache(&self) -> &LoopbackCacheRequestor {
        &self.cache
    }

    fn next_correlation(&self) -> SubscriptionCorrelationId {
        SubscriptionCorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn strip_share(filter: &str) -> &str {
    match filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => rest.split_once('/').map(|(_, topic)| topic).unwrap_or(rest),
        None => filter,
    }
}

fn resolved(event: SubscriptionEvent) -> SubscriptionConfirm {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(event);
    rx
}

impl Transport for LoopbackTransport {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn register_callback(&self, callback: RxCallback) -> DispatchToken {
        let token = DispatchToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.insert(token, callback);
        debug!(token = token.0, "loopback callback registered");
        token
    }

    fn unregister_callback(&self, token: DispatchToken) {
        self.callbacks.remove(&token);
        debug!(token = token.0, "loopback callback unregistered");
    }

    fn subscribe(
        &self,
        topic: &str,
        token: DispatchToken,
    ) -> Result<(SubscriptionCorrelationId, SubscriptionConfirm), TransportError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.subscribe_failures.lock().remove(topic) {
            return Err(err);
        }
        let id = self.next_correlation();
        if let Some(err) = self.confirm_failures.lock().remove(topic) {
            return Ok((id, resolved(SubscriptionEvent::failed(id, err))));
        }
        self.subscriptions.lock().push((topic.to_string(), token));
        if self.confirm_holds.lock().remove(topic) {
            let (tx, rx) = oneshot::channel();
            self.held_confirms.lock().insert(topic.to_string(), (id, tx));
            return Ok((id, rx));
        }
        Ok((id, resolved(SubscriptionEvent::confirmed(id))))
    }

    fn unsubscribe(
        &self,
        topic: &str,
        token: DispatchToken,
    ) -> Result<(SubscriptionCorrelationId, SubscriptionConfirm), TransportError> {
        if let Some(err) = self.unsubscribe_failures.lock().remove(topic) {
            return Err(err);
        }
        let id = self.next_correlation();
        self.subscriptions
            .lock()
            .retain(|(existing, owner)| !(existing == topic && *owner == token));
        Ok((id, resolved(SubscriptionEvent::confirmed(id))))
    }

    fn events(&self) -> &dyn Events {
        &self.events
    }

    fn increment_metric(&self, metric: Metric, amount: u64) {
        *self.metrics.entry(metric).or_insert(0) += amount;
    }

    fn cache_requestor(&self) -> &dyn CacheRequestor {
        &self.cache
    }
}

#[derive(Default)]
struct LoopbackEvents {
    next_id: AtomicU64,
    handlers: DashMap<HandlerId, (SessionEventKind, EventHandler)>,
}

impl LoopbackEvents {
    fn emit(&self, event: &SessionEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .iter()
            .filter(|entry| entry.value().0 == event.kind)
            .map(|entry| entry.value().1.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

impl Events for LoopbackEvents {
    fn add_handler(&self, kind: SessionEventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.insert(id, (kind, handler));
        id
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.remove(&id);
    }
}

/// Cache side of the loopback. Requests remain pending until answered.
#[derive(Default)]
pub struct LoopbackCacheRequestor {
    next_index: AtomicU64,
    forced_index: Mutex<Option<CacheRequestIndex>>,
    create_failure: Mutex<Option<TransportError>>,
    send_failure: Mutex<Option<TransportError>>,
    cancel_synthesizes: AtomicBool,
    pending: DashMap<CacheRequestIndex, (CacheRequest, CacheEventCallback)>,
    created: AtomicU64,
    sent: AtomicU64,
    destroyed: AtomicU64,
}

impl LoopbackCacheRequestor {
    /// Every request created while set reuses this index.
    pub fn force_index(&self, index: Option<CacheRequestIndex>) {
        *self.forced_index.lock() = index;
    }

    pub fn fail_next_create(&self, error: TransportError) {
        *self.create_failure.lock() = Some(error);
    }

    pub fn fail_next_send(&self, error: TransportError) {
        *self.send_failure.lock() = Some(error);
    }

    /// When true, cancellation hands a synthesized event back instead of
    /// reporting through the send-time callback.
    pub fn set_cancel_synthesizes(&self, value: bool) {
        self.cancel_synthesizes.store(value, Ordering::SeqCst);
    }

    pub fn pending(&self) -> Vec<CacheRequestIndex> {
        let mut indexes: Vec<CacheRequestIndex> =
            self.pending.iter().map(|entry| *entry.key()).collect();
        indexes.sort();
        indexes
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Completes a pending request. Returns false when nothing was pending under `index`.
    pub fn respond_to_cache_request(&self, index: CacheRequestIndex, outcome: CacheOutcome) -> bool {
        let Some((_, (request, callback))) = self.pending.remove(&index) else {
            return false;
        };
        callback(completion(&request, outcome));
        true
    }
}

fn completion(request: &CacheRequest, outcome: CacheOutcome) -> CacheEventInfo {
    CacheEventInfo {
        index: request.index,
        request_id: request.id,
        topic: request.config.topic.clone(),
        outcome,
        error: None,
    }
}

impl CacheRequestor for LoopbackCacheRequestor {
    fn create_cache_request(
        &self,
        config: &CachedMessageSubscriptionRequest,
        id: CacheRequestId,
        _token: DispatchToken,
    ) -> Result<CacheRequest, TransportError> {
        if let Some(err) = self.create_failure.lock().take() {
            return Err(err);
        }
        let index = match *self.forced_index.lock() {
            Some(index) => index,
            None => CacheRequestIndex(self.next_index.fetch_add(1, Ordering::Relaxed) + 1),
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(CacheRequest {
            index,
            id,
            config: config.clone(),
        })
    }

    fn send_cache_request(
        &self,
        request: &CacheRequest,
        on_event: CacheEventCallback,
        _token: DispatchToken,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.send_failure.lock().take() {
            return Err(err);
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(request.index, (request.clone(), on_event));
        Ok(())
    }

    fn destroy_cache_request(&self, request: &CacheRequest) -> Result<(), TransportError> {
        self.pending.remove(&request.index);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cancel_pending_cache_requests(&self, request: &CacheRequest) -> Option<CacheEventInfo> {
        let (_, (request, callback)) = self.pending.remove(&request.index)?;
        let event = completion(&request, CacheOutcome::Cancelled);
        if self.cancel_synthesizes.load(Ordering::SeqCst) {
            return Some(event);
        }
        callback(event);
        None
    }

    fn process_cache_event(&self, request: &CacheRequest, event: CacheEventInfo) -> CacheResponse {
        CacheResponse {
            request_id: request.id,
            topic: event.topic,
            outcome: event.outcome,
            error: event.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> RxCallback {
        Arc::new(move |_payload| {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        })
    }

    #[test]
    fn deliver_only_reaches_matching_subscriptions() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let token = transport.register_callback(counting_callback(Arc::clone(&seen)));
        let _ = transport.subscribe("a/b", token).expect("subscribe");
        assert_eq!(transport.deliver("a/c", Bytes::from_static(b"x")), 0);
        assert_eq!(transport.deliver("a/b", Bytes::from_static(b"x")), 1);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shared_subscription_matches_inner_topic() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let token = transport.register_callback(counting_callback(Arc::clone(&seen)));
        let _ = transport
            .subscribe("#share/group/a/b", token)
            .expect("subscribe");
        assert_eq!(transport.deliver("a/b", Bytes::from_static(b"x")), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let token = transport.register_callback(counting_callback(Arc::clone(&seen)));
        let _ = transport.subscribe("t", token).expect("subscribe");
        transport.unregister_callback(token);
        assert_eq!(transport.deliver("t", Bytes::from_static(b"x")), 0);
        assert_eq!(transport.registered_callbacks(), 0);
    }

    #[tokio::test]
    async fn confirm_failure_is_reported_on_the_channel() {
        let transport = LoopbackTransport::new();
        let token = transport.register_callback(Arc::new(|_| true));
        transport.fail_subscribe_confirm("t", TransportError::failed("denied"));
        let (_, confirm) = transport.subscribe("t", token).expect("subscribe");
        let event = confirm.await.expect("confirm");
        assert!(event.error.is_some());
        assert!(transport.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn held_confirmation_resolves_on_release() {
        let transport = LoopbackTransport::new();
        let token = transport.register_callback(Arc::new(|_| true));
        transport.hold_subscribe_confirm("t");
        let (id, mut confirm) = transport.subscribe("t", token).expect("subscribe");
        assert!(confirm.try_recv().is_err());
        assert_eq!(transport.subscriptions(), vec!["t".to_string()]);
        assert!(transport.release_subscribe_confirm("t"));
        assert!(!transport.release_subscribe_confirm("t"));
        let event = confirm.await.expect("confirm");
        assert_eq!(event.id, id);
        assert!(event.error.is_none());
        assert_eq!(transport.subscribe_calls(), 1);
    }

    #[test]
    fn cancel_reports_through_callback_unless_synthesizing() {
        let requestor = LoopbackCacheRequestor::default();
        let config = CachedMessageSubscriptionRequest::as_available("cache", "t");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let callback: CacheEventCallback = Arc::new(move |event| {
            assert_eq!(event.outcome, CacheOutcome::Cancelled);
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let first = requestor
            .create_cache_request(&config, CacheRequestId(1), DispatchToken(1))
            .expect("create");
        requestor
            .send_cache_request(&first, Arc::clone(&callback), DispatchToken(1))
            .expect("send");
        assert!(requestor.cancel_pending_cache_requests(&first).is_none());
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        requestor.set_cancel_synthesizes(true);
        let second = requestor
            .create_cache_request(&config, CacheRequestId(2), DispatchToken(1))
            .expect("create");
        requestor
            .send_cache_request(&second, callback, DispatchToken(1))
            .expect("send");
        let synthesized = requestor
            .cancel_pending_cache_requests(&second)
            .expect("synthesized event");
        assert_eq!(synthesized.request_id, CacheRequestId(2));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(requestor.pending().is_empty());
    }

    #[test]
    fn metrics_accumulate() {
        let transport = LoopbackTransport::new();
        transport.increment_metric(Metric::InternalDiscardNotifications, 2);
        transport.increment_metric(Metric::InternalDiscardNotifications, 3);
        assert_eq!(transport.metric(Metric::InternalDiscardNotifications), 5);
        assert_eq!(
            transport.metric(Metric::ReceivedMessagesBackpressureDiscarded),
            0
        );
    }
}
