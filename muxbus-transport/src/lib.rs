//! # muxbus-transport
//!
//! Transport runtime for muxbus.
//!
//! This crate provides:
//! - The `Transport` lifecycle with a once-per-cycle close signal
//! - Client and server frame registries
//! - A multiplexed stream transport backed by a bounded worker pool
//! - A reconnect monitor with exponential backoff

pub mod buffer;
pub mod config;
pub mod error;
pub mod monitor;
pub mod mux;
pub mod pool;
pub mod registry;
pub mod transport;

pub use buffer::WriteBuffer;
pub use config::{MuxConfig, ReconnectConfig};
pub use error::{BoxError, TransportError};
pub use monitor::{
    attach, BackoffMonitor, MonitorExit, MonitorHandle, MonitorSlot, TransportMonitor,
};
pub use mux::{Connector, MultiplexedTransport, StreamConnector, TcpConnector};
pub use pool::{JobHandler, PoolStats, WorkerPool};
pub use registry::{
    await_reply, ClientRegistry, FnProcessor, FrameCallback, Processor, Registry, ServerRegistry,
};
pub use transport::{
    check_frame_size, CloseReason, CloseWatch, RequestTransport, Transport, TransportCore,
    TransportState,
};
