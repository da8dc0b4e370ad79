//! muxbus - multiplexed RPC and pub/sub transports
//!
//! Correlated request/reply over a single stream connection, subject-based
//! request/reply and pub/sub over a message broker, header propagation
//! through per-call contexts, and reconnect supervision.
//!
//! The building blocks live in their own crates and are re-exported here:
//! - [`protocol`]: contexts, header blocks and frames
//! - [`transport`]: lifecycle, registries, the multiplexed stream transport
//!   and the reconnect monitor
//! - [`broker`]: broker-backed request/reply, scoped and streaming pub/sub

pub mod config;

pub use muxbus_broker as broker;
pub use muxbus_protocol as protocol;
pub use muxbus_transport as transport;

pub use config::{Config, ConfigError};
pub use muxbus_broker::{
    Broker, BrokerConfig, BrokerServer, BrokerTransport, MemoryBroker, MemoryStreamBroker,
    ScopeTransport, StreamingScopeTransport,
};
pub use muxbus_protocol::{Context, Frame, FrameProtocol, Headers};
pub use muxbus_transport::{
    attach, BackoffMonitor, ClientRegistry, MultiplexedTransport, MuxConfig, Processor,
    ReconnectConfig, RequestTransport, ServerRegistry, TcpConnector, Transport, TransportError,
};

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
}
