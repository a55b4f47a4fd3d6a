// Error taxonomy surfaced by every receiver operation.
use courier_transport::TransportError;

#[derive(thiserror::Error, Debug, Clone)]
pub enum ReceiverError {
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("terminated with {undelivered} undelivered messages")]
    IncompleteDelivery { undelivered: u64 },
    #[error(transparent)]
    Native(#[from] TransportError),
}

impl ReceiverError {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub(crate) fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ReceiverError>;
