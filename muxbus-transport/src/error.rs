//! Transport error types.

use muxbus_protocol::{ErrorKind, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by user processors and codecs.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport not open")]
    NotOpen,

    #[error("transport already open")]
    AlreadyOpen,

    #[error("transport already closed")]
    AlreadyClosed,

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("empty message")]
    EmptyMessage,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request with op id {0} already in flight")]
    DuplicateRequest(u64),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl TransportError {
    /// Returns the type tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Io(_) => ErrorKind::Io,
            TransportError::Protocol(_) => ErrorKind::Protocol,
            TransportError::NotOpen => ErrorKind::NotOpen,
            TransportError::AlreadyOpen => ErrorKind::AlreadyOpen,
            TransportError::AlreadyClosed => ErrorKind::AlreadyClosed,
            TransportError::Disconnected(_) => ErrorKind::Disconnected,
            TransportError::TooLarge { .. } => ErrorKind::TooLarge,
            TransportError::EmptyMessage => ErrorKind::EmptyMessage,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::DuplicateRequest(_) => ErrorKind::DuplicateRequest,
            TransportError::Dispatch(_) => ErrorKind::Dispatch,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Wraps a processor or callback failure as a connection-fatal dispatch error.
    pub fn dispatch(err: impl std::fmt::Display) -> Self {
        TransportError::Dispatch(err.to_string())
    }
}
