//! # muxbus-protocol
//!
//! Wire protocol for muxbus.
//!
//! This crate provides:
//! - Per-call request contexts with correlation and operation ids
//! - Versioned header blocks and length-prefixed frames
//! - A frame protocol handle that writes and reads context headers
//! - Error types and stable error kind tags

pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod headers;
pub mod protocol;

pub use codec::{PayloadCodec, RawCodec};
pub use context::{
    Context, ContextFactory, OpIdAllocator, OpIdSource, CID_HEADER, DEFAULT_TIMEOUT, OPID_HEADER,
    TIMEOUT_HEADER,
};
pub use error::{ErrorKind, ProtocolError};
pub use frame::{frame_body, Frame, FRAME_PREFIX_SIZE, MIN_FRAME_SIZE};
pub use headers::{
    add_headers_to_frame, decode_headers, encode_headers, headers_from_frame, HeaderVersion,
    Headers,
};
pub use protocol::{op_id_from_headers, FrameProtocol};

/// Maximum size of a single frame on a stream transport (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
