//! Protocol error types and error kind tags.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while encoding or decoding header blocks and frames.
///
/// Every variant is fatal to the frame (and, on a shared stream, to the
/// connection carrying it). Nothing at this layer is retried.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported header version: {0}")]
    BadVersion(u8),

    #[error("frame too short: {len} bytes (need at least {min})")]
    FrameTooShort { len: usize, min: usize },

    #[error("declared {field} length {declared} exceeds remaining {remaining} bytes")]
    SizeMismatch {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("frame length prefix {declared} does not match body of {actual} bytes")]
    LengthPrefixMismatch { declared: usize, actual: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid value for header {name}: {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("invalid UTF-8 in header {0}")]
    InvalidUtf8(&'static str),

    #[error("payload codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Stable type tag attached to every error surfaced by the runtime.
///
/// Callers use it to tell "retry is safe" apart from "payload was rejected"
/// and "fatal, rebuild the client".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // Fatal to the frame or connection
    Protocol,
    Dispatch,

    // Lifecycle misuse
    NotOpen,
    AlreadyOpen,
    AlreadyClosed,
    DuplicateRequest,

    // Payload rejected
    TooLarge,
    EmptyMessage,

    // Transient
    Disconnected,
    Timeout,
    Io,
}

impl ErrorKind {
    /// Returns whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotOpen | ErrorKind::Disconnected | ErrorKind::Timeout | ErrorKind::Io
        )
    }

    /// Returns whether the error means the client must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Protocol | ErrorKind::Dispatch)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Protocol => write!(f, "PROTOCOL"),
            ErrorKind::Dispatch => write!(f, "DISPATCH"),
            ErrorKind::NotOpen => write!(f, "NOT_OPEN"),
            ErrorKind::AlreadyOpen => write!(f, "ALREADY_OPEN"),
            ErrorKind::AlreadyClosed => write!(f, "ALREADY_CLOSED"),
            ErrorKind::DuplicateRequest => write!(f, "DUPLICATE_REQUEST"),
            ErrorKind::TooLarge => write!(f, "TOO_LARGE"),
            ErrorKind::EmptyMessage => write!(f, "EMPTY_MESSAGE"),
            ErrorKind::Disconnected => write!(f, "DISCONNECTED"),
            ErrorKind::Timeout => write!(f, "TIMEOUT"),
            ErrorKind::Io => write!(f, "IO"),
        }
    }
}
