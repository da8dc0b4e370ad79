//! Durable streaming pub/sub.
//!
//! Publishing works as on [`ScopeTransport`]. Durable subscriptions replay
//! from the broker's retained log, and every delivered frame carries the
//! broker-assigned sequence and receipt time as headers.

use crate::broker::{prefixed_subject, Broker, Message, StreamBroker, SubscribeOptions, Subscription};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::scope::{FrameHandler, ScopeTransport, SubscribeSource, TopicGuard};
use async_trait::async_trait;
use bytes::Bytes;
use muxbus_protocol::{add_headers_to_frame, Headers};
use muxbus_transport::{CloseWatch, MonitorSlot, Transport, TransportError};
use std::sync::Arc;

/// Header carrying the stream sequence number.
pub const SEQUENCE_HEADER: &str = "_seq";

/// Header carrying the broker receipt time in milliseconds since the epoch.
pub const TIMESTAMP_HEADER: &str = "_timestamp";

struct DurableSource {
    broker: Arc<dyn StreamBroker>,
    topic: String,
    subject: String,
    options: SubscribeOptions,
}

#[async_trait]
impl SubscribeSource for DurableSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        self.broker
            .subscribe_durable(&self.subject, self.options.clone())
            .await
    }

    fn prepare(&self, msg: Message) -> Result<Bytes, TransportError> {
        let Some(meta) = msg.meta else {
            return Ok(msg.data);
        };
        let mut extra = Headers::new();
        extra.insert(SEQUENCE_HEADER.to_string(), meta.sequence.to_string());
        extra.insert(
            TIMESTAMP_HEADER.to_string(),
            meta.timestamp.timestamp_millis().to_string(),
        );
        Ok(add_headers_to_frame(&msg.data, &extra)?.freeze())
    }
}

/// Pub/sub transport over a [`StreamBroker`] with durable subscriptions.
pub struct StreamingScopeTransport {
    scope: ScopeTransport,
    broker: Arc<dyn StreamBroker>,
}

impl StreamingScopeTransport {
    pub fn new<B>(broker: Arc<B>, config: &BrokerConfig) -> Self
    where
        B: StreamBroker + 'static,
    {
        let plain: Arc<dyn Broker> = broker.clone();
        Self {
            scope: ScopeTransport::new(plain, config),
            broker,
        }
    }

    pub async fn lock_topic(&self, topic: &str) -> Result<TopicGuard<'_>, TransportError> {
        self.scope.lock_topic(topic).await
    }

    pub async fn publish(&self, topic: &str, frame: &[u8]) -> Result<(), TransportError> {
        self.scope.publish(topic, frame).await
    }

    /// Live subscription without replay or stream headers.
    pub async fn subscribe(
        &self,
        topic: &str,
        queue: Option<&str>,
        handler: FrameHandler,
    ) -> Result<(), TransportError> {
        self.scope.subscribe(topic, queue, handler).await
    }

    /// Durable subscription; frames carry `_seq` and `_timestamp` headers.
    pub async fn subscribe_durable(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: FrameHandler,
    ) -> Result<(), TransportError> {
        let source = Arc::new(DurableSource {
            broker: self.broker.clone(),
            topic: topic.to_string(),
            subject: prefixed_subject(topic),
            options,
        });
        self.scope.add_subscription(source, handler).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.scope.unsubscribe(topic).await
    }
}

#[async_trait]
impl Transport for StreamingScopeTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.scope.open().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.scope.close().await
    }

    fn is_open(&self) -> bool {
        self.scope.is_open()
    }

    fn closed(&self) -> CloseWatch {
        self.scope.closed()
    }

    fn monitor_slot(&self) -> &MonitorSlot {
        self.scope.monitor_slot()
    }
}
