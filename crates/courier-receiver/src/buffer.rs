// Bounded inbound buffer with drop-oldest / drop-latest overflow handling.
//
// `push` runs on transport delivery threads and never waits: overflow is
// resolved under the queue lock in bounded time. Loss is reported through a
// shared discard marker that tags exactly one later delivery.
//
// Tag placement depends on the policy:
// - DropOldest: the evicted message was older than everything still queued,
//   so the next message popped carries the tag.
// - DropLatest: the queued messages all predate the loss, so the tag rides on
//   the next message accepted by `push`.
use courier_transport::InboundPayload;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::config::BackpressurePolicy;

#[derive(Debug)]
pub(crate) struct InboundEnvelope {
    pub(crate) payload: InboundPayload,
    pub(crate) discard: bool,
}

/// Result of offering a message to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Queued,
    /// Queued after evicting the oldest element.
    QueuedDroppedOldest,
    /// Refused under DropLatest because the buffer was full.
    Discarded,
    Closed,
}

/// Pending "a message was lost before this one" indication.
///
/// At most one indication is outstanding; repeated drops before the next
/// delivery collapse into one.
#[derive(Debug, Default)]
pub(crate) struct DiscardMarker {
    pending: AtomicBool,
}

impl DiscardMarker {
    pub(crate) fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Claims the pending indication. Exactly one caller wins per raise.
    pub(crate) fn consume(&self) -> bool {
        self.pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

struct Queue {
    items: VecDeque<InboundEnvelope>,
    closed: bool,
}

pub(crate) struct InboundBuffer {
    queue: Mutex<Queue>,
    capacity: usize,
    policy: BackpressurePolicy,
    marker: DiscardMarker,
    // Mirrors `Queue::closed`; set only after the queue itself is closed.
    closed: AtomicBool,
    available: Notify,
}

impl InboundBuffer {
    pub(crate) fn new(policy: BackpressurePolicy, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            marker: DiscardMarker::default(),
            closed: AtomicBool::new(false),
            available: Notify::new(),
        }
    }

    pub(crate) fn push(&self, payload: InboundPayload) -> Admission {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Admission::Closed;
        }
        let admission = if queue.items.len() < self.capacity {
            let discard = self.policy == BackpressurePolicy::DropLatest && self.marker.consume();
            queue.items.push_back(InboundEnvelope { payload, discard });
            Admission::Queued
        } else {
            metrics::counter!(
                "courier_receiver_backpressure_dropped_total",
                "policy" => self.policy.as_str()
            )
            .increment(1);
            match self.policy {
                BackpressurePolicy::DropOldest => {
                    queue.items.pop_front();
                    self.marker.raise();
                    queue.items.push_back(InboundEnvelope {
                        payload,
                        discard: false,
                    });
                    Admission::QueuedDroppedOldest
                }
                BackpressurePolicy::DropLatest => {
                    self.marker.raise();
                    return Admission::Discarded;
                }
            }
        };
        drop(queue);
        self.available.notify_one();
        admission
    }

    /// Removes the head of the queue without consulting the discard marker.
    pub(crate) fn take(&self) -> Option<InboundEnvelope> {
        self.queue.lock().items.pop_front()
    }

    /// Attaches a pending drop-oldest indication to a message already taken.
    ///
    /// This runs after the queue lock is released, so a drop that happens
    /// between `take` and this call may tag a message that left the queue
    /// before the loss. The indication is informational and this ordering
    /// is accepted.
    pub(crate) fn apply_discard_tag(&self, mut envelope: InboundEnvelope) -> InboundEnvelope {
        if self.policy == BackpressurePolicy::DropOldest && self.marker.consume() {
            envelope.discard = true;
        }
        envelope
    }

    pub(crate) fn try_pop(&self) -> Option<InboundEnvelope> {
        self.take().map(|envelope| self.apply_discard_tag(envelope))
    }

    /// Waits for the next message. `None` once the buffer is closed and empty.
    pub(crate) async fn pop(&self) -> Option<InboundEnvelope> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(envelope) = self.try_pop() {
                return Some(envelope);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Closes the buffer to further pushes. Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let first = {
            let mut queue = self.queue.lock();
            !std::mem::replace(&mut queue.closed, true)
        };
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frees every queued message and returns how many there were.
    pub(crate) fn drain_all(&self) -> u64 {
        let drained: Vec<InboundEnvelope> = self.queue.lock().items.drain(..).collect();
        self.available.notify_waiters();
        drained.len() as u64
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().items.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn discard_pending(&self) -> bool {
        self.marker.is_pending()
    }
}

/// One-shot broadcast signal; the first `fire` wins and wakes every waiter.
#[derive(Default)]
pub(crate) struct OnceSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl OnceSignal {
    pub(crate) fn fire(&self) -> bool {
        let first = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}
