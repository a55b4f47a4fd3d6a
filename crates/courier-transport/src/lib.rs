// Transport collaborator contract consumed by the receiver core.
//
// Session establishment, wire encoding, TLS and reconnection all live below
// this boundary. The receiver only sees:
// - a delivery hook (`register_callback` / `unregister_callback`),
// - topic filter management that confirms asynchronously,
// - session events (down notifications),
// - a cache requestor capability set,
// - telemetry counters.
//
// Delivery callbacks are invoked synchronously on transport-owned threads and
// must never block on application progress.
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

pub mod cache;
pub mod events;
pub mod loopback;

pub use cache::{
    CacheEventCallback, CacheEventInfo, CacheOutcome, CacheRequest, CacheRequestId,
    CacheRequestIndex, CacheRequestStrategy, CacheRequestor, CacheResponse,
    CachedMessageSubscriptionRequest,
};
pub use events::{EventHandler, Events, HandlerId, SessionEvent, SessionEventKind};
pub use loopback::LoopbackTransport;

/// Correlation token handed out by [`Transport::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchToken(pub u64);

/// Correlation id returned for each subscribe/unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionCorrelationId(pub u64);

/// Delivery hook installed by a receiver. Returns `true` when the payload was retained.
pub type RxCallback = Arc<dyn Fn(InboundPayload) -> bool + Send + Sync>;

/// Confirmation channel for a subscription change.
pub type SubscriptionConfirm = oneshot::Receiver<SubscriptionEvent>;

/// A message handed up from the transport. Owned exclusively until delivered or dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    topic: Arc<str>,
    payload: Bytes,
}

impl InboundPayload {
    pub fn new(topic: impl Into<Arc<str>>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Outcome of a subscribe or unsubscribe once the broker has answered.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub id: SubscriptionCorrelationId,
    pub error: Option<TransportError>,
}

impl SubscriptionEvent {
    pub fn confirmed(id: SubscriptionCorrelationId) -> Self {
        Self { id, error: None }
    }

    pub fn failed(id: SubscriptionCorrelationId, error: TransportError) -> Self {
        Self {
            id,
            error: Some(error),
        }
    }
}

/// Telemetry counters the receiver reports through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    ReceivedMessagesBackpressureDiscarded,
    ReceivedMessagesTerminationDiscarded,
    InternalDiscardNotifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    WouldBlock,
    NotReady,
    Failed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::WouldBlock => write!(f, "would block"),
            TransportErrorKind::NotReady => write!(f, "not ready"),
            TransportErrorKind::Failed => write!(f, "failed"),
        }
    }
}

/// Native error surfaced by the transport layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("transport {kind} (subcode {subcode}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub subcode: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, subcode: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            subcode,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Failed, 0, message)
    }
}

/// The lower transport layer a receiver is built on.
pub trait Transport: Send + Sync + 'static {
    fn is_running(&self) -> bool;

    fn register_callback(&self, callback: RxCallback) -> DispatchToken;

    fn unregister_callback(&self, token: DispatchToken);

    fn subscribe(
        &self,
        topic: &str,
        token: DispatchToken,
    ) -> Result<(SubscriptionCorrelationId, SubscriptionConfirm), TransportError>;

    fn unsubscribe(
        &self,
        topic: &str,
        token: DispatchToken,
    ) -> Result<(SubscriptionCorrelationId, SubscriptionConfirm), TransportError>;

    fn events(&self) -> &dyn Events;

    fn increment_metric(&self, metric: Metric, amount: u64);

    fn cache_requestor(&self) -> &dyn CacheRequestor;
}
