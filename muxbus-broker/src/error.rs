//! Broker error types.

use muxbus_transport::TransportError;
use thiserror::Error;

/// Errors reported by a [`Broker`](crate::broker::Broker).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("payload of {size} bytes exceeds broker limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("durable subscription {0} is already active")]
    DurableInUse(String),
}

impl From<BrokerError> for TransportError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotConnected => {
                TransportError::Disconnected("broker connection lost".to_string())
            }
            BrokerError::PayloadTooLarge { size, max } => TransportError::TooLarge { size, max },
            other => TransportError::Dispatch(other.to_string()),
        }
    }
}
