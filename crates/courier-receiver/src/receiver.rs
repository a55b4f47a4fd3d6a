// Direct message receiver: the public handle tying the pieces together.
//
// `DirectMessageReceiver` is a cheap clone of an `Arc<ReceiverInner>`. The
// transport only ever sees weak references, so dropping every handle lets the
// receiver go even if the transport keeps stale callbacks around.
use arc_swap::ArcSwapOption;
use courier_transport::{
    CacheRequestId, CacheResponse, CachedMessageSubscriptionRequest, DispatchToken, HandlerId,
    InboundPayload, Metric, SessionEvent, SessionEventKind, Transport, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::buffer::{Admission, InboundBuffer, InboundEnvelope, OnceSignal};
use crate::cache::{CacheRegistry, CacheResponseCallback, ResponseProcessor};
use crate::config::BackpressurePolicy;
use crate::dispatcher::Dispatcher;
use crate::error::{ReceiverError, Result};
use crate::lifecycle::{Lifecycle, ReceiverState, Transition};
use crate::message::{InboundMessage, MessageHandler, into_message};
use crate::subscription::{
    Subscription, SubscriptionChangeListener, SubscriptionManager, SubscriptionOperation,
    ensure_started, ensure_topic,
};
use crate::termination::TerminationListener;

#[derive(Clone, Copy)]
pub(crate) struct Attachment {
    pub(crate) token: DispatchToken,
    pub(crate) handler: HandlerId,
}

pub(crate) struct ReceiverInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) buffer: Arc<InboundBuffer>,
    pub(crate) drained: Arc<OnceSignal>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) cache: CacheRegistry,
    pub(crate) startup: Vec<Subscription>,
    pub(crate) attachment: Mutex<Option<Attachment>>,
    pub(crate) runtime: Mutex<Option<Handle>>,
    // Cause of a down-event seen while Starting; replayed once start succeeds.
    deferred_down: Mutex<Option<Option<TransportError>>>,
    pub(crate) termination_listener: ArcSwapOption<TerminationListener>,
}

/// Outcome of a single synchronous receive wait.
enum ReceiveOutcome {
    Delivered(InboundEnvelope),
    TimedOut,
    Terminated,
}

impl ReceiverInner {
    pub(crate) fn token(&self) -> Option<DispatchToken> {
        let attachment = *self.attachment.lock();
        attachment.map(|attachment| attachment.token)
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.runtime.lock().clone()
    }

    async fn run_start(self: Arc<Self>) -> Result<()> {
        *self.runtime.lock() = Some(Handle::current());
        let weak = Arc::downgrade(&self);
        let handler = self.transport.events().add_handler(
            SessionEventKind::Down,
            Arc::new(move |event: &SessionEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_session_down(event);
                }
            }),
        );
        let weak = Arc::downgrade(&self);
        let token = self
            .transport
            .register_callback(Arc::new(move |payload: InboundPayload| {
                weak.upgrade().is_some_and(|inner| inner.accept(payload))
            }));
        *self.attachment.lock() = Some(Attachment { token, handler });

        let result = self
            .subscriptions
            .subscribe_startup(self.transport.as_ref(), token, &self.startup)
            .await;
        match &result {
            Ok(()) => {
                self.dispatcher.spawn(
                    &Handle::current(),
                    Arc::clone(&self.buffer),
                    Arc::clone(&self.drained),
                    Arc::clone(&self.transport),
                );
                debug!(token = token.0, "receiver started");
            }
            Err(err) => {
                warn!(error = %err, "receiver failed to start");
                self.detach();
            }
        }
        self.lifecycle.finish_start(result.clone());
        let deferred = self.deferred_down.lock().take();
        if result.is_ok()
            && let Some(cause) = deferred
        {
            debug!("replaying session down received during start");
            tokio::spawn(Arc::clone(&self).unsolicited_termination(cause));
        }
        result
    }

    /// Deregisters the delivery callback and down-event handler.
    pub(crate) fn detach(&self) {
        let attachment = self.attachment.lock().take();
        if let Some(attachment) = attachment {
            self.transport.unregister_callback(attachment.token);
            self.transport.events().remove_handler(attachment.handler);
        }
    }

    /// Delivery hook called on transport threads. Never waits.
    fn accept(&self, payload: InboundPayload) -> bool {
        if self.lifecycle.is_terminating_or_terminated() {
            self.transport
                .increment_metric(Metric::ReceivedMessagesTerminationDiscarded, 1);
            return false;
        }
        match self.buffer.push(payload) {
            Admission::Queued => true,
            Admission::QueuedDroppedOldest => {
                self.transport
                    .increment_metric(Metric::ReceivedMessagesBackpressureDiscarded, 1);
                true
            }
            Admission::Discarded => {
                self.transport
                    .increment_metric(Metric::ReceivedMessagesBackpressureDiscarded, 1);
                false
            }
            Admission::Closed => {
                self.transport
                    .increment_metric(Metric::ReceivedMessagesTerminationDiscarded, 1);
                false
            }
        }
    }

    fn on_session_down(self: Arc<Self>, event: &SessionEvent) {
        let cause = event.error.clone();
        {
            // Checked under the lock `run_start` takes after leaving Starting,
            // so a deferred event is always picked up.
            let mut deferred = self.deferred_down.lock();
            if self.lifecycle.state() == ReceiverState::Starting {
                debug!(event = %event, "session down while starting; deferring termination");
                *deferred = Some(cause);
                return;
            }
        }
        let Some(runtime) = self.runtime() else {
            warn!(event = %event, "session down before the receiver had a runtime");
            return;
        };
        runtime.spawn(self.unsolicited_termination(cause));
    }
}

/// A receiver that delivers topic messages straight from the transport.
#[derive(Clone)]
pub struct DirectMessageReceiver {
    inner: Arc<ReceiverInner>,
}

impl DirectMessageReceiver {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        policy: BackpressurePolicy,
        capacity: usize,
        share_name: Option<String>,
        startup: Vec<Subscription>,
    ) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                transport,
                lifecycle: Lifecycle::new(),
                buffer: Arc::new(InboundBuffer::new(policy, capacity)),
                drained: Arc::new(OnceSignal::default()),
                dispatcher: Dispatcher::new(),
                subscriptions: SubscriptionManager::new(share_name),
                cache: CacheRegistry::new(),
                startup,
                attachment: Mutex::new(None),
                runtime: Mutex::new(None),
                deferred_down: Mutex::new(None),
                termination_listener: ArcSwapOption::empty(),
            }),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.inner.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.lifecycle.is_terminating()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lifecycle.is_terminated()
    }

    /// Starts the receiver. Concurrent callers share the outcome of the first.
    pub async fn start(&self) -> Result<()> {
        let transport_ready = self.inner.transport.is_running();
        match self.inner.lifecycle.begin_start(transport_ready) {
            Transition::Finished(result) => result,
            Transition::Wait(outcome) => outcome.wait().await,
            Transition::Proceed => {
                // Runs detached so a dropped caller cannot strand the receiver in Starting.
                match tokio::spawn(Arc::clone(&self.inner).run_start()).await {
                    Ok(result) => result,
                    Err(err) => Err(ReceiverError::IllegalState(format!(
                        "start task failed: {err}"
                    ))),
                }
            }
        }
    }

    pub fn start_async(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let receiver = self.clone();
        tokio::spawn(async move {
            let _ = tx.send(receiver.start().await);
        });
        rx
    }

    pub fn start_async_callback<F>(&self, callback: F)
    where
        F: FnOnce(&DirectMessageReceiver, Result<()>) + Send + 'static,
    {
        let receiver = self.clone();
        tokio::spawn(async move {
            let result = receiver.start().await;
            callback(&receiver, result);
        });
    }

    /// Terminates the receiver.
    ///
    /// `None` waits as long as it takes for buffered messages to be delivered;
    /// `Some(Duration::ZERO)` discards them immediately. Messages still queued
    /// when the grace period ends are reported as [`ReceiverError::IncompleteDelivery`].
    pub async fn terminate(&self, grace_period: Option<Duration>) -> Result<()> {
        match self.inner.lifecycle.begin_terminate() {
            Transition::Finished(result) => result,
            Transition::Wait(outcome) => outcome.wait().await,
            Transition::Proceed => {
                match tokio::spawn(Arc::clone(&self.inner).shutdown(grace_period)).await {
                    Ok(result) => result,
                    Err(err) => Err(ReceiverError::IllegalState(format!(
                        "terminate task failed: {err}"
                    ))),
                }
            }
        }
    }

    pub fn terminate_async(&self, grace_period: Option<Duration>) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let receiver = self.clone();
        tokio::spawn(async move {
            let _ = tx.send(receiver.terminate(grace_period).await);
        });
        rx
    }

    pub fn terminate_async_callback<F>(&self, grace_period: Option<Duration>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let receiver = self.clone();
        tokio::spawn(async move {
            callback(receiver.terminate(grace_period).await);
        });
    }

    pub fn set_termination_listener(&self, listener: TerminationListener) {
        self.inner.termination_listener.store(Some(Arc::new(listener)));
    }

    fn attached_token(&self) -> Result<DispatchToken> {
        self.inner
            .token()
            .ok_or_else(|| ReceiverError::illegal_state("receiver is not started"))
    }

    pub async fn add_subscription(&self, subscription: &Subscription) -> Result<()> {
        ensure_started(&self.inner.lifecycle)?;
        let token = self.attached_token()?;
        self.inner
            .subscriptions
            .add(
                &self.inner.lifecycle,
                self.inner.transport.as_ref(),
                token,
                subscription,
            )
            .await
    }

    pub async fn remove_subscription(&self, subscription: &Subscription) -> Result<()> {
        ensure_started(&self.inner.lifecycle)?;
        let token = self.attached_token()?;
        self.inner
            .subscriptions
            .remove(
                &self.inner.lifecycle,
                self.inner.transport.as_ref(),
                token,
                subscription,
            )
            .await
    }

    /// Validates synchronously, then subscribes on a background task.
    pub fn add_subscription_async(
        &self,
        subscription: Subscription,
        listener: Option<SubscriptionChangeListener>,
    ) -> Result<()> {
        self.change_subscription_async(subscription, SubscriptionOperation::Added, listener)
    }

    pub fn remove_subscription_async(
        &self,
        subscription: Subscription,
        listener: Option<SubscriptionChangeListener>,
    ) -> Result<()> {
        self.change_subscription_async(subscription, SubscriptionOperation::Removed, listener)
    }

    fn change_subscription_async(
        &self,
        subscription: Subscription,
        operation: SubscriptionOperation,
        listener: Option<SubscriptionChangeListener>,
    ) -> Result<()> {
        ensure_started(&self.inner.lifecycle)?;
        ensure_topic(&subscription)?;
        let runtime = self
            .inner
            .runtime()
            .ok_or_else(|| ReceiverError::illegal_state("receiver is not started"))?;
        let receiver = self.clone();
        runtime.spawn(async move {
            let result = match operation {
                SubscriptionOperation::Added => receiver.add_subscription(&subscription).await,
                SubscriptionOperation::Removed => {
                    receiver.remove_subscription(&subscription).await
                }
            };
            if let Err(err) = &result {
                debug!(subscription = %subscription, error = %err, "subscription change failed");
            }
            if let Some(listener) = listener {
                listener(&subscription, operation, &result);
            }
        });
        Ok(())
    }

    /// Waits for the next buffered message.
    ///
    /// `None` blocks until a message arrives or the receiver finishes
    /// terminating; `Some(timeout)` fails with [`ReceiverError::Timeout`] once
    /// it elapses.
    pub async fn receive_message(&self, timeout: Option<Duration>) -> Result<InboundMessage> {
        match self.inner.lifecycle.state() {
            ReceiverState::NotStarted | ReceiverState::Starting => {
                return Err(ReceiverError::illegal_state(
                    "receiver must be started before receiving",
                ));
            }
            ReceiverState::Terminated => {
                return Err(ReceiverError::illegal_state("receiver is already terminated"));
            }
            ReceiverState::Started | ReceiverState::Terminating => {}
        }
        let buffer = &self.inner.buffer;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, buffer.pop()).await {
                Ok(Some(envelope)) => ReceiveOutcome::Delivered(envelope),
                Ok(None) => ReceiveOutcome::Terminated,
                Err(_) => ReceiveOutcome::TimedOut,
            },
            None => match buffer.pop().await {
                Some(envelope) => ReceiveOutcome::Delivered(envelope),
                None => ReceiveOutcome::Terminated,
            },
        };
        if buffer.is_closed() && buffer.is_empty() && self.inner.drained.fire() {
            debug!("inbound buffer drained by receive");
        }
        match outcome {
            ReceiveOutcome::Delivered(envelope) => {
                Ok(into_message(envelope, self.inner.transport.as_ref()))
            }
            ReceiveOutcome::TimedOut => Err(ReceiverError::Timeout(format!(
                "no message received within {timeout:?}"
            ))),
            ReceiveOutcome::Terminated => {
                Err(ReceiverError::illegal_state("receiver terminated while receiving"))
            }
        }
    }

    /// Installs (or replaces) the push-delivery handler.
    pub fn receive_async(&self, handler: MessageHandler) -> Result<()> {
        if self.inner.lifecycle.is_terminating_or_terminated() {
            return Err(ReceiverError::illegal_state(
                "cannot install a handler on a terminating receiver",
            ));
        }
        self.inner.dispatcher.set_handler(handler);
        Ok(())
    }

    /// Requests cached messages; the response arrives on the returned channel.
    pub fn request_cached_async(
        &self,
        request: &CachedMessageSubscriptionRequest,
        id: CacheRequestId,
    ) -> Result<oneshot::Receiver<CacheResponse>> {
        let (tx, rx) = oneshot::channel();
        self.submit_cache_request(request, id, ResponseProcessor::Channel(tx))?;
        Ok(rx)
    }

    pub fn request_cached_async_with_callback(
        &self,
        request: &CachedMessageSubscriptionRequest,
        id: CacheRequestId,
        callback: CacheResponseCallback,
    ) -> Result<()> {
        self.submit_cache_request(request, id, ResponseProcessor::Callback(callback))
    }

    fn submit_cache_request(
        &self,
        request: &CachedMessageSubscriptionRequest,
        id: CacheRequestId,
        processor: ResponseProcessor,
    ) -> Result<()> {
        let (Some(runtime), Some(token)) = (self.inner.runtime(), self.inner.token()) else {
            return Err(ReceiverError::illegal_state(
                "cache requests require a started receiver",
            ));
        };
        self.inner.cache.submit(
            &self.inner.lifecycle,
            &runtime,
            &self.inner.transport,
            token,
            request,
            id,
            processor,
        )
    }

    /// Topics currently subscribed, as handed to the transport.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.active()
    }

    pub fn outstanding_cache_requests(&self) -> usize {
        self.inner.cache.outstanding()
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }
}
