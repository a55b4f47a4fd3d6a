// Application-facing inbound message.
use bytes::Bytes;
use courier_transport::{InboundPayload, Metric, Transport};
use std::sync::Arc;

use crate::buffer::InboundEnvelope;

/// A delivered message plus the discard indication it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    payload: InboundPayload,
    discard: bool,
}

impl InboundMessage {
    pub fn topic(&self) -> &str {
        self.payload.topic()
    }

    pub fn payload(&self) -> &Bytes {
        self.payload.payload()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload.into_payload()
    }

    /// True when one or more messages were dropped by backpressure before this one.
    ///
    /// The message itself is intact; only the messages preceding it were lost.
    pub fn has_discard_indication(&self) -> bool {
        self.discard
    }
}

/// Push-delivery callback. May be swapped at any time with `receive_async`.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

pub(crate) fn into_message(envelope: InboundEnvelope, transport: &dyn Transport) -> InboundMessage {
    if envelope.discard {
        transport.increment_metric(Metric::InternalDiscardNotifications, 1);
        metrics::counter!("courier_receiver_discard_notifications_total").increment(1);
    }
    InboundMessage {
        payload: envelope.payload,
        discard: envelope.discard,
    }
}
