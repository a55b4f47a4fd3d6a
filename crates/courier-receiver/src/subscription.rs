// Topic subscription bookkeeping for a receiver.
//
// Two locks with different jobs:
// - `serialize` orders subscribe/unsubscribe calls into the transport.
// - `termination` is read-held by every mutation and write-held by the
//   termination cleanup, so nothing is subscribed once teardown has begun.
// The active list itself is a plain mutex; it is never held across an await.
use courier_transport::{
    DispatchToken, SubscriptionConfirm, SubscriptionCorrelationId, Transport, TransportError,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ReceiverError, Result};
use crate::lifecycle::Lifecycle;

const SHARE_PREFIX: &str = "#share";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Topic,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: String,
    kind: SubscriptionKind,
}

impl Subscription {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SubscriptionKind::Topic,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SubscriptionKind::Queue,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOperation {
    Added,
    Removed,
}

/// Receives the outcome of `add_subscription_async` / `remove_subscription_async`.
pub type SubscriptionChangeListener =
    Arc<dyn Fn(&Subscription, SubscriptionOperation, &Result<()>) + Send + Sync>;

pub fn validate_share_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ReceiverError::illegal_argument("share name must not be empty"));
    }
    if name.contains(['>', '*']) {
        return Err(ReceiverError::IllegalArgument(format!(
            "share name must not contain wildcard characters: {name}"
        )));
    }
    Ok(())
}

pub(crate) fn ensure_topic(subscription: &Subscription) -> Result<()> {
    match subscription.kind {
        SubscriptionKind::Topic => Ok(()),
        kind => Err(ReceiverError::IllegalArgument(format!(
            "direct receivers only support topic subscriptions, got {kind:?}"
        ))),
    }
}

pub(crate) fn ensure_started(lifecycle: &Lifecycle) -> Result<()> {
    if lifecycle.is_running() {
        Ok(())
    } else {
        Err(ReceiverError::IllegalState(format!(
            "cannot modify subscriptions in state {:?}",
            lifecycle.state()
        )))
    }
}

async fn confirmed(
    change: std::result::Result<(SubscriptionCorrelationId, SubscriptionConfirm), TransportError>,
) -> Result<()> {
    let (_, confirm) = change?;
    await_confirm(confirm).await
}

async fn await_confirm(confirm: SubscriptionConfirm) -> Result<()> {
    match confirm.await {
        Ok(event) => match event.error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        },
        Err(_) => Err(ReceiverError::illegal_state(
            "subscription confirmation was dropped by the transport",
        )),
    }
}

pub(crate) struct SubscriptionManager {
    share_name: Option<String>,
    active: Mutex<Vec<String>>,
    serialize: tokio::sync::Mutex<()>,
    termination: tokio::sync::RwLock<()>,
}

impl SubscriptionManager {
    pub(crate) fn new(share_name: Option<String>) -> Self {
        Self {
            share_name,
            active: Mutex::new(Vec::new()),
            serialize: tokio::sync::Mutex::new(()),
            termination: tokio::sync::RwLock::new(()),
        }
    }

    /// Topic string handed to the transport, with the share prefix applied.
    pub(crate) fn resolve(&self, subscription: &Subscription) -> Result<String> {
        ensure_topic(subscription)?;
        Ok(match &self.share_name {
            Some(share) => format!("{SHARE_PREFIX}/{share}/{}", subscription.name),
            None => subscription.name.clone(),
        })
    }

    pub(crate) fn active(&self) -> Vec<String> {
        self.active.lock().clone()
    }

    fn record(&self, topic: String) {
        let mut active = self.active.lock();
        if !active.contains(&topic) {
            active.push(topic);
        }
    }

    fn forget(&self, topic: &str) {
        self.active.lock().retain(|existing| existing != topic);
    }

    /// Subscribes every startup subscription, then awaits all confirmations.
    /// On the first failure whatever was added is removed again.
    pub(crate) async fn subscribe_startup(
        &self,
        transport: &dyn Transport,
        token: DispatchToken,
        subscriptions: &[Subscription],
    ) -> Result<()> {
        let _serial = self.serialize.lock().await;
        let mut issued: Vec<(String, SubscriptionConfirm)> = Vec::new();
        let mut failure = None;
        for subscription in subscriptions {
            let topic = match self.resolve(subscription) {
                Ok(topic) => topic,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            match transport.subscribe(&topic, token) {
                Ok((_, confirm)) => issued.push((topic, confirm)),
                Err(err) => {
                    failure = Some(err.into());
                    break;
                }
            }
        }
        let mut added = Vec::new();
        for (topic, confirm) in issued {
            match await_confirm(confirm).await {
                Ok(()) => added.push(topic),
                Err(err) if failure.is_none() => failure = Some(err),
                Err(_) => {}
            }
        }
        if let Some(err) = failure {
            warn!(error = %err, "startup subscription failed");
            for topic in added {
                if let Err(cleanup) = transport.unsubscribe(&topic, token) {
                    warn!(topic = %topic, error = %cleanup, "failed to roll back startup subscription");
                }
            }
            return Err(err);
        }
        for topic in added {
            debug!(topic = %topic, "startup subscription added");
            self.record(topic);
        }
        Ok(())
    }

    pub(crate) async fn add(
        &self,
        lifecycle: &Lifecycle,
        transport: &dyn Transport,
        token: DispatchToken,
        subscription: &Subscription,
    ) -> Result<()> {
        ensure_started(lifecycle)?;
        let topic = self.resolve(subscription)?;
        let _termination = self.termination.read().await;
        ensure_started(lifecycle)?;
        let _serial = self.serialize.lock().await;
        confirmed(transport.subscribe(&topic, token)).await?;
        debug!(topic = %topic, "subscription added");
        self.record(topic);
        Ok(())
    }

    pub(crate) async fn remove(
        &self,
        lifecycle: &Lifecycle,
        transport: &dyn Transport,
        token: DispatchToken,
        subscription: &Subscription,
    ) -> Result<()> {
        ensure_started(lifecycle)?;
        let topic = self.resolve(subscription)?;
        let _termination = self.termination.read().await;
        ensure_started(lifecycle)?;
        let _serial = self.serialize.lock().await;
        confirmed(transport.unsubscribe(&topic, token)).await?;
        debug!(topic = %topic, "subscription removed");
        self.forget(&topic);
        Ok(())
    }

    /// Best-effort removal of every active subscription during termination.
    pub(crate) async fn cleanup(&self, transport: &dyn Transport, token: DispatchToken) {
        let _termination = self.termination.write().await;
        let topics = std::mem::take(&mut *self.active.lock());
        for topic in topics {
            match confirmed(transport.unsubscribe(&topic, token)).await {
                Ok(()) => debug!(topic = %topic, "subscription removed on termination"),
                Err(err) => {
                    warn!(topic = %topic, error = %err, "failed to remove subscription on termination")
                }
            }
        }
    }
}
