//! Scoped pub/sub transport over broker topics.
//!
//! Publishers lock a topic, buffer one frame and flush it; at most one publish
//! per topic is in flight from a transport, while different topics proceed
//! independently. Subscribers receive full frames through a callback.

use crate::broker::{prefixed_subject, Broker, Message, Subscription};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use muxbus_protocol::{frame_body, MIN_FRAME_SIZE};
use muxbus_transport::{
    check_frame_size, BoxError, CloseReason, CloseWatch, MonitorSlot, Transport, TransportCore,
    TransportError, WriteBuffer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

/// Callback receiving each subscribed frame.
pub type FrameHandler = Arc<dyn Fn(Bytes) -> Result<(), BoxError> + Send + Sync>;

/// How a subscription is (re)established and how its messages become frames.
#[async_trait]
pub(crate) trait SubscribeSource: Send + Sync {
    fn topic(&self) -> &str;

    async fn subscribe(&self) -> Result<Subscription, BrokerError>;

    fn prepare(&self, msg: Message) -> Result<Bytes, TransportError> {
        Ok(msg.data)
    }
}

struct PlainSource {
    broker: Arc<dyn Broker>,
    topic: String,
    subject: String,
    queue: Option<String>,
}

#[async_trait]
impl SubscribeSource for PlainSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        self.broker
            .subscribe(&self.subject, self.queue.as_deref())
            .await
    }
}

struct SubscriptionSpec {
    source: Arc<dyn SubscribeSource>,
    handler: FrameHandler,
}

struct ScopeInner {
    broker: Arc<dyn Broker>,
    core: TransportCore,
    limit: usize,
    topics: DashMap<String, Arc<tokio::sync::Mutex<WriteBuffer>>>,
    specs: Mutex<Vec<Arc<SubscriptionSpec>>>,
    pumps: Mutex<Vec<(String, JoinHandle<()>)>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ScopeInner {
    fn spawn_pump(self: &Arc<Self>, spec: Arc<SubscriptionSpec>, sub: Subscription) {
        let topic = spec.source.topic().to_string();
        let task = tokio::spawn(pump(self.clone(), spec, sub));
        self.pumps.lock().push((topic, task));
    }

    fn abort_pumps(&self) {
        for (_, task) in self.pumps.lock().drain(..) {
            task.abort();
        }
    }
}

async fn pump(inner: Arc<ScopeInner>, spec: Arc<SubscriptionSpec>, mut sub: Subscription) {
    let topic = spec.source.topic();
    while let Some(msg) = sub.next().await {
        if msg.data.len() < MIN_FRAME_SIZE {
            tracing::warn!(
                "discarding {} byte frame on {} (minimum {})",
                msg.data.len(),
                topic,
                MIN_FRAME_SIZE
            );
            continue;
        }

        let frame = match spec.source.prepare(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("discarding malformed frame on {}: {}", topic, e);
                continue;
            }
        };

        if let Err(e) = (spec.handler)(frame) {
            tracing::warn!("subscriber for {} failed: {}", topic, e);
        }
    }

    // The broker dropped the subscription out from under an open transport
    let cause = TransportError::Disconnected(format!("subscription to {} lost", topic));
    if inner.core.mark_closed(CloseReason::unclean(cause)).is_ok() {
        inner.abort_pumps();
    }
}

/// Exclusive publish slot for one topic.
///
/// Held for the duration of one frame; dropping it discards anything not
/// flushed and lets the next publisher on the topic proceed.
pub struct TopicGuard<'a> {
    inner: &'a ScopeInner,
    topic: String,
    subject: String,
    buffer: OwnedMutexGuard<WriteBuffer>,
}

impl TopicGuard<'_> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Appends bytes to the frame body.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.buffer.write(data)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Publishes the buffered frame.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.inner.core.ensure_open()?;
        let frame = self.buffer.finish();
        check_frame_size(&frame, self.inner.limit)?;
        self.inner.broker.publish(&self.subject, None, frame).await?;
        tracing::trace!("published frame to {}", self.subject);
        Ok(())
    }
}

impl Drop for TopicGuard<'_> {
    fn drop(&mut self) {
        self.buffer.reset();
    }
}

/// Pub/sub transport over a [`Broker`].
///
/// Subscriptions survive close/open cycles: every subscription made while
/// open is re-established on the next successful open.
pub struct ScopeTransport {
    inner: Arc<ScopeInner>,
}

impl ScopeTransport {
    pub fn new(broker: Arc<dyn Broker>, config: &BrokerConfig) -> Self {
        let limit = config.max_message_size.min(broker.max_payload());
        Self {
            inner: Arc::new(ScopeInner {
                broker,
                core: TransportCore::new(),
                limit,
                topics: DashMap::new(),
                specs: Mutex::new(Vec::new()),
                pumps: Mutex::new(Vec::new()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Largest frame published, prefix included.
    pub fn size_limit(&self) -> usize {
        self.inner.limit
    }

    /// Waits for exclusive use of `topic`.
    pub async fn lock_topic(&self, topic: &str) -> Result<TopicGuard<'_>, TransportError> {
        self.inner.core.ensure_open()?;
        let slot = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(WriteBuffer::new(self.inner.limit))))
            .clone();
        let buffer = slot.lock_owned().await;
        Ok(TopicGuard {
            inner: &self.inner,
            topic: topic.to_string(),
            subject: prefixed_subject(topic),
            buffer,
        })
    }

    /// Publishes one full frame to `topic`.
    pub async fn publish(&self, topic: &str, frame: &[u8]) -> Result<(), TransportError> {
        check_frame_size(frame, self.inner.limit)?;
        let body = frame_body(frame)?;
        let mut guard = self.lock_topic(topic).await?;
        guard.write(body)?;
        guard.flush().await
    }

    /// Subscribes `handler` to `topic`, optionally as a queue group member.
    pub async fn subscribe(
        &self,
        topic: &str,
        queue: Option<&str>,
        handler: FrameHandler,
    ) -> Result<(), TransportError> {
        let source = Arc::new(PlainSource {
            broker: self.inner.broker.clone(),
            topic: topic.to_string(),
            subject: prefixed_subject(topic),
            queue: queue.map(str::to_string),
        });
        self.add_subscription(source, handler).await
    }

    pub(crate) async fn add_subscription(
        &self,
        source: Arc<dyn SubscribeSource>,
        handler: FrameHandler,
    ) -> Result<(), TransportError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.core.ensure_open()?;

        let sub = source.subscribe().await?;
        tracing::debug!("subscribed to {}", sub.subject());
        let spec = Arc::new(SubscriptionSpec { source, handler });
        self.inner.specs.lock().push(spec.clone());
        self.inner.spawn_pump(spec, sub);
        Ok(())
    }

    /// Drops every subscription on `topic`.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.core.ensure_open()?;
        self.inner
            .specs
            .lock()
            .retain(|spec| spec.source.topic() != topic);
        self.inner.pumps.lock().retain(|(t, task)| {
            if t == topic {
                task.abort();
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// Number of subscriptions restored on reopen.
    pub fn subscription_count(&self) -> usize {
        self.inner.specs.lock().len()
    }
}

#[async_trait]
impl Transport for ScopeTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.core.ensure_closed()?;
        if !self.inner.broker.is_connected() {
            return Err(TransportError::Disconnected(
                "broker not connected".to_string(),
            ));
        }

        self.inner.abort_pumps();
        let specs = self.inner.specs.lock().clone();
        let mut restored = Vec::with_capacity(specs.len());
        for spec in specs {
            let sub = spec.source.subscribe().await?;
            restored.push((spec, sub));
        }

        self.inner.core.mark_open()?;
        if !restored.is_empty() {
            tracing::info!("restored {} subscriptions", restored.len());
        }
        for (spec, sub) in restored {
            self.inner.spawn_pump(spec, sub);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.core.mark_closed(CloseReason::Clean)?;
        self.inner.abort_pumps();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.core.is_open()
    }

    fn closed(&self) -> CloseWatch {
        self.inner.core.closed()
    }

    fn monitor_slot(&self) -> &MonitorSlot {
        self.inner.core.monitor_slot()
    }
}

impl Drop for ScopeTransport {
    fn drop(&mut self) {
        self.inner.abort_pumps();
    }
}
