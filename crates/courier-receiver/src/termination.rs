// Termination coordinator.
//
// Explicit termination, in order:
// 1. remove subscriptions (under the termination write lock),
// 2. deregister the delivery callback and down-event handler,
// 3. park the dispatcher gate if no handler ever opened it and close the
//    buffer to new deliveries,
// 4. wait for the drained signal, racing the grace period,
// 5. on timeout cancel and join the dispatcher and free whatever is left,
// 6. tear down cache requests and report the outcome.
//
// A session-down event skips step 1 (the connection is gone) and does not
// wait at all: the buffer is discarded straight away.
use courier_transport::{Metric, TransportError};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{ReceiverError, Result};
use crate::receiver::ReceiverInner;

/// Reported to the termination listener once a receiver is terminated.
#[derive(Debug, Clone)]
pub struct TerminationEvent {
    timestamp: SystemTime,
    cause: Option<TransportError>,
}

impl TerminationEvent {
    pub fn new(cause: Option<TransportError>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            cause,
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The transport error behind an unsolicited termination; `None` when the
    /// application asked for it.
    pub fn cause(&self) -> Option<&TransportError> {
        self.cause.as_ref()
    }
}

impl fmt::Display for TerminationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        match &self.cause {
            Some(cause) => write!(
                f,
                "Receiver Termination Event - timestamp: {millis}ms, cause: {cause}"
            ),
            None => write!(
                f,
                "Receiver Termination Event - timestamp: {millis}ms, cause: none"
            ),
        }
    }
}

pub type TerminationListener = Arc<dyn Fn(&TerminationEvent) + Send + Sync>;

impl ReceiverInner {
    pub(crate) async fn shutdown(self: Arc<Self>, grace_period: Option<Duration>) -> Result<()> {
        debug!(
            grace_period = ?grace_period,
            buffered = self.buffer.len(),
            "terminating receiver"
        );
        if let Some(token) = self.token() {
            self.subscriptions
                .cleanup(self.transport.as_ref(), token)
                .await;
        }
        self.detach();
        self.dispatcher.stop_gate();
        self.buffer.close();
        if self.buffer.is_empty() {
            self.drained.fire();
        }

        let drained = match grace_period {
            Some(limit) => tokio::time::timeout(limit, self.drained.wait())
                .await
                .is_ok(),
            None => {
                self.drained.wait().await;
                true
            }
        };
        let result = if drained {
            self.dispatcher.join().await;
            Ok(())
        } else {
            let undelivered = self.force_stop().await;
            if undelivered == 0 {
                Ok(())
            } else {
                warn!(undelivered, "grace period elapsed with messages still buffered");
                Err(ReceiverError::IncompleteDelivery { undelivered })
            }
        };

        self.cache.teardown(self.transport.as_ref()).await;
        self.lifecycle.finish_terminate(result.clone());
        self.notify_termination(None);
        result
    }

    async fn force_stop(&self) -> u64 {
        self.dispatcher.cancel();
        self.dispatcher.join().await;
        let undelivered = self.buffer.drain_all();
        if undelivered > 0 {
            self.transport
                .increment_metric(Metric::ReceivedMessagesTerminationDiscarded, undelivered);
        }
        self.drained.fire();
        undelivered
    }

    pub(crate) async fn unsolicited_termination(self: Arc<Self>, cause: Option<TransportError>) {
        if !self.lifecycle.begin_unsolicited() {
            debug!("session down after termination began; ignoring");
            return;
        }
        warn!(cause = ?cause, "session down; terminating receiver");
        self.detach();
        self.dispatcher.stop_gate();
        self.buffer.close();
        self.dispatcher.cancel();
        let undelivered = self.buffer.drain_all();
        if undelivered > 0 {
            self.transport
                .increment_metric(Metric::ReceivedMessagesTerminationDiscarded, undelivered);
        }
        self.drained.fire();

        // The transport cause travels in the termination event; the stored
        // outcome only reports what was lost.
        let result = if undelivered > 0 {
            debug!(undelivered, "terminated with undelivered messages");
            Err(ReceiverError::IncompleteDelivery { undelivered })
        } else {
            Ok(())
        };
        self.lifecycle.finish_terminate(result);
        self.notify_termination(cause);
        self.cache.teardown(self.transport.as_ref()).await;
    }

    fn notify_termination(&self, cause: Option<TransportError>) {
        let Some(listener) = self.termination_listener.load_full() else {
            return;
        };
        let event = TerminationEvent::new(cause);
        debug!(event = %event, "notifying termination listener");
        if catch_unwind(AssertUnwindSafe(|| (*listener)(&event))).is_err() {
            metrics::counter!("courier_receiver_callback_panics_total").increment(1);
            warn!("termination listener panicked");
        }
    }
}
