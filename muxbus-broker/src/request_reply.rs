//! Request/reply over broker subjects.
//!
//! The calling side publishes each request frame to the service subject with a
//! fresh inbox as its reply subject. The serving side subscribes to the service
//! subject, runs each request through a [`ServerRegistry`] on a worker pool and
//! publishes the response frame to the message's reply subject.

use crate::broker::{prefixed_subject, Broker, Message};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use bytes::Bytes;
use muxbus_protocol::{Context, MIN_FRAME_SIZE};
use muxbus_transport::{
    await_reply, check_frame_size, ClientRegistry, CloseReason, CloseWatch, JobHandler,
    MonitorSlot, PoolStats, Processor, Registry, RequestTransport, ServerRegistry, Transport,
    TransportCore, TransportError, WorkerPool, WriteBuffer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Stateless request/reply transport over a [`Broker`].
pub struct BrokerTransport {
    broker: Arc<dyn Broker>,
    subject: String,
    registry: Arc<dyn Registry>,
    core: TransportCore,
    limit: usize,
    buffer: Mutex<WriteBuffer>,
}

impl BrokerTransport {
    /// Creates a transport calling the service named `service`.
    pub fn new(broker: Arc<dyn Broker>, service: &str, config: &BrokerConfig) -> Self {
        let limit = config.max_message_size.min(broker.max_payload());
        Self {
            broker,
            subject: prefixed_subject(service),
            registry: Arc::new(ClientRegistry::new()),
            core: TransportCore::new(),
            limit,
            buffer: Mutex::new(WriteBuffer::new(limit)),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// The service subject requests are published to.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Appends bytes to the pending request frame body.
    ///
    /// Crossing the size limit fails with `TooLarge` and empties the buffer.
    pub fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.core.ensure_open()?;
        self.buffer.lock().write(data)
    }

    /// Bytes buffered for the pending request (prefix excluded).
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Sends the buffered frame as a request and waits for the reply frame.
    ///
    /// On a closed transport the buffer is left as it is.
    pub async fn flush(&self, ctx: &Context) -> Result<Bytes, TransportError> {
        self.core.ensure_open()?;
        let frame = self.buffer.lock().finish();
        self.request(ctx, frame).await
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.core.ensure_closed()?;
        if !self.broker.is_connected() {
            return Err(TransportError::Disconnected(
                "broker not connected".to_string(),
            ));
        }
        // Bytes left over from the previous cycle are never sent
        self.buffer.lock().reset();
        self.core.mark_open()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.core.mark_closed(CloseReason::Clean)
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn closed(&self) -> CloseWatch {
        self.core.closed()
    }

    fn monitor_slot(&self) -> &MonitorSlot {
        self.core.monitor_slot()
    }
}

#[async_trait]
impl RequestTransport for BrokerTransport {
    async fn request(&self, ctx: &Context, frame: Bytes) -> Result<Bytes, TransportError> {
        self.core.ensure_open()?;
        check_frame_size(&frame, self.limit)?;

        // Subscribe before publishing so a fast reply cannot be missed
        let inbox = self.broker.new_inbox();
        let mut replies = self.broker.subscribe(&inbox, None).await?;

        // The pump outlives its subscription so a reply handed to the registry
        // just before the inbox closes still wins; a lost inbox times out.
        let registry = self.registry.clone();
        let pump = async move {
            while let Some(msg) = replies.next().await {
                if let Err(e) = registry.execute(msg.data).await {
                    tracing::warn!("dropping reply on {}: {}", msg.subject, e);
                }
            }
            tracing::debug!("reply subscription ended");
            std::future::pending::<()>().await
        };

        let send = async {
            self.broker
                .publish(&self.subject, Some(inbox.as_str()), frame)
                .await
                .map_err(TransportError::from)
        };

        tokio::select! {
            reply = await_reply(self.registry.as_ref(), ctx, send) => reply,
            _ = pump => Err(TransportError::Disconnected(
                "reply subscription ended".to_string(),
            )),
        }
    }

    async fn oneway(&self, _ctx: &Context, frame: Bytes) -> Result<(), TransportError> {
        self.core.ensure_open()?;
        check_frame_size(&frame, self.limit)?;
        self.broker.publish(&self.subject, None, frame).await?;
        Ok(())
    }

    fn request_size_limit(&self) -> usize {
        self.limit
    }
}

struct Responder {
    broker: Arc<dyn Broker>,
    registry: Arc<dyn Registry>,
    limit: usize,
}

#[async_trait]
impl JobHandler<Message> for Responder {
    async fn handle(&self, msg: Message) {
        let Some(reply) = msg.reply else {
            tracing::warn!("discarding request on {} without reply subject", msg.subject);
            return;
        };
        if msg.data.len() < MIN_FRAME_SIZE {
            tracing::warn!(
                "discarding {} byte frame on {} (minimum {})",
                msg.data.len(),
                msg.subject,
                MIN_FRAME_SIZE
            );
            return;
        }

        match self.registry.execute(msg.data).await {
            Ok(Some(response)) => {
                if let Err(e) = check_frame_size(&response, self.limit) {
                    tracing::error!("response for {} not sent: {}", msg.subject, e);
                    return;
                }
                if let Err(e) = self.broker.publish(&reply, None, response).await {
                    tracing::error!("failed to publish response to {}: {}", reply, e);
                }
            }
            Ok(None) => {}
            // Messages are independent; one failure does not stop the server
            Err(e) => tracing::error!("request on {} failed: {}", msg.subject, e),
        }
    }
}

struct Running {
    pool: Arc<WorkerPool<Message>>,
    dispatch: JoinHandle<()>,
}

/// Serves a processor on a broker subject.
pub struct BrokerServer {
    broker: Arc<dyn Broker>,
    subject: String,
    queue: Option<String>,
    registry: Arc<dyn Registry>,
    config: BrokerConfig,
    running: Mutex<Option<Running>>,
}

impl BrokerServer {
    pub fn new(
        broker: Arc<dyn Broker>,
        service: &str,
        processor: Arc<dyn Processor>,
        config: BrokerConfig,
    ) -> Self {
        let limit = config.max_message_size.min(broker.max_payload());
        Self {
            broker,
            subject: prefixed_subject(service),
            queue: None,
            registry: Arc::new(ServerRegistry::new(processor, limit)),
            config,
            running: Mutex::new(None),
        }
    }

    /// Joins a queue group so that servers in the group share requests.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> Option<Arc<PoolStats>> {
        self.running.lock().as_ref().map(|r| r.pool.stats_handle())
    }

    /// Subscribes to the service subject and starts serving.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.is_running() {
            return Err(TransportError::AlreadyOpen);
        }

        let mut requests = self
            .broker
            .subscribe(&self.subject, self.queue.as_deref())
            .await?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let responder = Arc::new(Responder {
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            limit: self.config.max_message_size.min(self.broker.max_payload()),
        });
        let pool = Arc::new(WorkerPool::start(
            self.config.workers,
            self.config.queue_len,
            self.config.watermark(),
            responder,
        ));

        let subject = self.subject.clone();
        let queue = pool.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(msg) = requests.next().await {
                if queue.submit(msg).await.is_err() {
                    break;
                }
            }
            tracing::warn!("service subscription on {} ended", subject);
        });

        tracing::info!(
            "serving {} (queue {:?}, {} workers)",
            self.subject,
            self.queue,
            self.config.workers.max(1)
        );
        *running = Some(Running { pool, dispatch });
        Ok(())
    }

    /// Unsubscribes and waits for in-flight requests to finish.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let running = self
            .running
            .lock()
            .take()
            .ok_or(TransportError::AlreadyClosed)?;
        running.dispatch.abort();
        let _ = running.dispatch.await;
        running.pool.join().await;
        tracing::info!("stopped serving {}", self.subject);
        Ok(())
    }
}
