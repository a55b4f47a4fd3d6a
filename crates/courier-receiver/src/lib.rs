// In-process delivery core for direct message receivers.
//
// The transport hands messages over on its own threads; this crate buffers
// them under an explicit backpressure policy and delivers them by pull
// (`receive_message`) or push (`receive_async`). It also runs the cache
// request protocol on top of the transport's cache session.
//
// CONCURRENCY LAYOUT
// ------------------
// Per receiver there is:
// - one dispatcher task, parked until a push handler is installed,
// - one cache poller task, created by the first cache request,
// - the transport's delivery threads calling into `InboundBuffer::push`.
//
// Push never waits on the application. Overflow is settled under the
// buffer lock in bounded time, and loss is surfaced as a discard indication
// on a later message instead of blocking the transport.
//
// Lifecycle state, the discard marker, the buffer-closed flag and the cache
// outstanding counter are atomics. The subscription list and the cache
// registry sit behind mutexes because their invariants (no duplicate topic,
// no duplicate index) need check-then-act.
pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod receiver;
pub mod subscription;
pub mod termination;

mod buffer;
mod dispatcher;

pub use builder::DirectReceiverBuilder;
pub use cache::CacheResponseCallback;
pub use config::{BackpressurePolicy, MAX_OUTSTANDING_CACHE_REQUESTS, ReceiverConfig};
pub use error::{ReceiverError, Result};
pub use lifecycle::ReceiverState;
pub use message::{InboundMessage, MessageHandler};
pub use receiver::DirectMessageReceiver;
pub use subscription::{
    Subscription, SubscriptionChangeListener, SubscriptionKind, SubscriptionOperation,
    validate_share_name,
};
pub use termination::{TerminationEvent, TerminationListener};
