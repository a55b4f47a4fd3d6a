//! Cache request capability set.
//!
//! A cache request asks the broker's cache for historical messages on a topic.
//! The transport owns the cache session: it allocates a unique
//! [`CacheRequestIndex`] per request, sends it, and later reports exactly one
//! [`CacheEventInfo`] per request through the callback supplied at send time
//! (or hands back a synthesized event from
//! [`CacheRequestor::cancel_pending_cache_requests`] when it could not cancel
//! in time).
use std::sync::Arc;

use crate::{DispatchToken, TransportError};

/// Application-chosen id that is echoed back in the matching [`CacheResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheRequestId(pub u64);

/// Transport-assigned key of an in-flight cache session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheRequestIndex(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRequestStrategy {
    AsAvailable,
    LiveCancelsCached,
    CachedFirst,
    CachedOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessageSubscriptionRequest {
    pub strategy: CacheRequestStrategy,
    pub cache_name: String,
    pub topic: String,
    pub cache_access_timeout_ms: u32,
    pub max_cached_messages: u32,
    pub cached_message_age_s: u32,
}

impl CachedMessageSubscriptionRequest {
    pub fn new(
        strategy: CacheRequestStrategy,
        cache_name: impl Into<String>,
        topic: impl Into<String>,
        cache_access_timeout_ms: u32,
        max_cached_messages: u32,
        cached_message_age_s: u32,
    ) -> Self {
        Self {
            strategy,
            cache_name: cache_name.into(),
            topic: topic.into(),
            cache_access_timeout_ms,
            max_cached_messages,
            cached_message_age_s,
        }
    }

    // Zero for both limits means "no limit".
    pub fn as_available(cache_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::new(
            CacheRequestStrategy::AsAvailable,
            cache_name,
            topic,
            5000,
            0,
            0,
        )
    }
}

/// Handle to a cache session created by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub index: CacheRequestIndex,
    pub id: CacheRequestId,
    pub config: CachedMessageSubscriptionRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Ok,
    NoData,
    SuspectData,
    Failed,
    Cancelled,
}

/// Raw cache completion as reported by the transport.
#[derive(Debug, Clone)]
pub struct CacheEventInfo {
    pub index: CacheRequestIndex,
    pub request_id: CacheRequestId,
    pub topic: String,
    pub outcome: CacheOutcome,
    pub error: Option<TransportError>,
}

/// Application-facing result of a cache request.
#[derive(Debug, Clone)]
pub struct CacheResponse {
    pub request_id: CacheRequestId,
    pub topic: String,
    pub outcome: CacheOutcome,
    pub error: Option<TransportError>,
}

/// Invoked by the transport, on its own thread, when a cache session completes.
pub type CacheEventCallback = Arc<dyn Fn(CacheEventInfo) + Send + Sync>;

pub trait CacheRequestor: Send + Sync {
    fn create_cache_request(
        &self,
        config: &CachedMessageSubscriptionRequest,
        id: CacheRequestId,
        token: DispatchToken,
    ) -> Result<CacheRequest, TransportError>;

    fn send_cache_request(
        &self,
        request: &CacheRequest,
        on_event: CacheEventCallback,
        token: DispatchToken,
    ) -> Result<(), TransportError>;

    fn destroy_cache_request(&self, request: &CacheRequest) -> Result<(), TransportError>;

    /// Cancels a pending request. `None` means the transport will report the
    /// cancellation through the send-time callback itself; `Some` carries an
    /// event the caller must route on its behalf.
    fn cancel_pending_cache_requests(&self, request: &CacheRequest) -> Option<CacheEventInfo>;

    /// Converts a raw completion into the response handed to the application,
    /// releasing any transport-side resources for the session.
    fn process_cache_event(&self, request: &CacheRequest, event: CacheEventInfo) -> CacheResponse;
}
