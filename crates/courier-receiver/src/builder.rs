// Builder for direct message receivers.
use courier_transport::Transport;
use std::sync::Arc;

use crate::config::{BackpressurePolicy, DEFAULT_BUFFER_CAPACITY, ReceiverConfig};
use crate::error::{ReceiverError, Result};
use crate::receiver::DirectMessageReceiver;
use crate::subscription::{Subscription, ensure_topic, validate_share_name};

pub struct DirectReceiverBuilder {
    transport: Arc<dyn Transport>,
    backpressure: BackpressurePolicy,
    buffer_capacity: usize,
    share_name: Option<String>,
    subscriptions: Vec<Subscription>,
}

impl DirectReceiverBuilder {
    /// Drop-oldest with a capacity of 50 unless told otherwise.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            backpressure: BackpressurePolicy::DropOldest,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            share_name: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn from_config(mut self, config: &ReceiverConfig) -> Self {
        self.backpressure = config.backpressure;
        self.buffer_capacity = config.buffer_capacity;
        self.share_name = config.share_name.clone();
        self
    }

    /// On overflow, discard the arriving message.
    pub fn on_back_pressure_drop_latest(mut self, buffer_capacity: usize) -> Self {
        self.backpressure = BackpressurePolicy::DropLatest;
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// On overflow, evict the oldest buffered message.
    pub fn on_back_pressure_drop_oldest(mut self, buffer_capacity: usize) -> Self {
        self.backpressure = BackpressurePolicy::DropOldest;
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Subscriptions added when the receiver starts.
    pub fn with_subscriptions(mut self, subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        self.subscriptions.extend(subscriptions);
        self
    }

    pub fn build(self) -> Result<DirectMessageReceiver> {
        let share_name = self.share_name.clone();
        self.finish(share_name)
    }

    /// Builds a receiver whose subscriptions are shared under `share_name`.
    pub fn build_with_share_name(self, share_name: &str) -> Result<DirectMessageReceiver> {
        self.finish(Some(share_name.to_string()))
    }

    fn finish(self, share_name: Option<String>) -> Result<DirectMessageReceiver> {
        if self.buffer_capacity < 1 {
            return Err(ReceiverError::InvalidConfiguration(format!(
                "buffer capacity must be at least 1, got {}",
                self.buffer_capacity
            )));
        }
        if let Some(name) = &share_name {
            validate_share_name(name)?;
        }
        for subscription in &self.subscriptions {
            ensure_topic(subscription)?;
        }
        Ok(DirectMessageReceiver::new(
            self.transport,
            self.backpressure,
            self.buffer_capacity,
            share_name,
            self.subscriptions,
        ))
    }
}
