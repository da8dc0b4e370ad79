//! # muxbus-broker
//!
//! Broker-backed transports for muxbus.
//!
//! This crate provides:
//! - A `Broker` abstraction with in-process implementations
//! - Stateless request/reply over subjects (`BrokerTransport`, `BrokerServer`)
//! - Scoped pub/sub with per-topic publish locks (`ScopeTransport`)
//! - Durable streaming pub/sub (`StreamingScopeTransport`)

pub mod broker;
pub mod config;
pub mod error;
pub mod request_reply;
pub mod scope;
pub mod streaming;

pub use broker::{
    new_inbox, prefixed_subject, Broker, MemoryBroker, MemoryStreamBroker, Message,
    StartPosition, StreamBroker, StreamMeta, SubscribeOptions, Subscription, DEFAULT_MAX_PAYLOAD,
    INBOX_PREFIX, SUBJECT_PREFIX,
};
pub use config::{BrokerConfig, MAX_MESSAGE_SIZE};
pub use error::BrokerError;
pub use request_reply::{BrokerServer, BrokerTransport};
pub use scope::{FrameHandler, ScopeTransport, TopicGuard};
pub use streaming::{StreamingScopeTransport, SEQUENCE_HEADER, TIMESTAMP_HEADER};
