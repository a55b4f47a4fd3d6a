// Session event notifications.
use std::fmt;
use std::sync::Arc;

use crate::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Down,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub info: String,
    pub error: Option<TransportError>,
}

impl SessionEvent {
    pub fn down(info: impl Into<String>, error: Option<TransportError>) -> Self {
        Self {
            kind: SessionEventKind::Down,
            info: info.into(),
            error,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(err) => write!(f, "{:?}: {} ({err})", self.kind, self.info),
            None => write!(f, "{:?}: {}", self.kind, self.info),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Handlers run on transport threads; they should hand work off rather than block.
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

pub trait Events: Send + Sync {
    fn add_handler(&self, kind: SessionEventKind, handler: EventHandler) -> HandlerId;

    fn remove_handler(&self, id: HandlerId);
}
