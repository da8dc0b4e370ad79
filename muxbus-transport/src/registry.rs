//! Frame registries: route incoming frames to waiting callers or a processor.

use crate::buffer::WriteBuffer;
use crate::error::{BoxError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use muxbus_protocol::{headers_from_frame, op_id_from_headers, Context, FrameProtocol};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Callback invoked with a full response frame.
pub type FrameCallback = Arc<dyn Fn(Bytes) -> Result<(), TransportError> + Send + Sync>;

/// Routes full frames (length prefix included) read off a transport.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Registers a callback for the context's operation id.
    fn register(&self, ctx: &Context, callback: FrameCallback) -> Result<(), TransportError>;

    /// Removes the callback for the context's operation id.
    fn unregister(&self, ctx: &Context);

    /// Handles one frame. Returns a frame to write back, if any.
    ///
    /// An error is fatal for the connection the frame arrived on.
    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>, TransportError>;
}

/// Caller-side registry keyed by operation id.
#[derive(Default)]
pub struct ClientRegistry {
    handlers: RwLock<HashMap<u64, FrameCallback>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight registrations.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[async_trait]
impl Registry for ClientRegistry {
    fn register(&self, ctx: &Context, callback: FrameCallback) -> Result<(), TransportError> {
        let op_id = ctx.op_id();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&op_id) {
            return Err(TransportError::DuplicateRequest(op_id));
        }
        handlers.insert(op_id, callback);
        Ok(())
    }

    fn unregister(&self, ctx: &Context) {
        if self.handlers.write().remove(&ctx.op_id()).is_none() {
            tracing::debug!("unregister of unknown op id {}", ctx.op_id());
        }
    }

    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>, TransportError> {
        let headers = headers_from_frame(&frame)?;
        let op_id = op_id_from_headers(&headers)?;

        let callback = self.handlers.read().get(&op_id).cloned();
        let Some(callback) = callback else {
            // Caller gave up or timed out; the late frame is dropped
            tracing::debug!("no handler for op id {}, dropping frame", op_id);
            return Ok(None);
        };

        callback(frame).map_err(TransportError::dispatch)?;
        Ok(None)
    }
}

/// Application handler behind a [`ServerRegistry`].
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handles a request payload and returns the response payload.
    async fn process(&self, ctx: &Context, payload: Bytes) -> Result<Bytes, BoxError>;
}

/// Adapts a synchronous closure into a [`Processor`].
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F>
where
    F: Fn(&Context, Bytes) -> Result<Bytes, BoxError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Context, Bytes) -> Result<Bytes, BoxError> + Send + Sync,
{
    async fn process(&self, ctx: &Context, payload: Bytes) -> Result<Bytes, BoxError> {
        (self.0)(ctx, payload)
    }
}

/// Callee-side registry: decodes requests, runs the processor, frames responses.
pub struct ServerRegistry {
    processor: Arc<dyn Processor>,
    protocol: FrameProtocol,
    response_limit: usize,
}

impl ServerRegistry {
    /// `response_limit` bounds response frames, prefix included (0 = unlimited).
    pub fn new(processor: Arc<dyn Processor>, response_limit: usize) -> Self {
        Self {
            processor,
            protocol: FrameProtocol::new(),
            response_limit,
        }
    }

    pub fn with_protocol(mut self, protocol: FrameProtocol) -> Self {
        self.protocol = protocol;
        self
    }
}

#[async_trait]
impl Registry for ServerRegistry {
    fn register(&self, _ctx: &Context, _callback: FrameCallback) -> Result<(), TransportError> {
        Ok(())
    }

    fn unregister(&self, _ctx: &Context) {}

    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>, TransportError> {
        let (ctx, payload) = self.protocol.decode_request(&frame)?;
        let body = self
            .processor
            .process(&ctx, payload)
            .await
            .map_err(TransportError::dispatch)?;

        let mut buf = WriteBuffer::new(self.response_limit);
        buf.write(&self.protocol.response_header_block(&ctx))?;
        buf.write(&body)?;
        Ok(Some(buf.finish()))
    }
}

/// Registers for the reply to `ctx`, runs `send`, and waits up to
/// `ctx.timeout()` for the reply frame.
///
/// The registration is removed on every exit path.
pub async fn await_reply<F>(
    registry: &dyn Registry,
    ctx: &Context,
    send: F,
) -> Result<Bytes, TransportError>
where
    F: Future<Output = Result<(), TransportError>> + Send,
{
    let (tx, rx) = oneshot::channel::<Bytes>();
    let tx = Mutex::new(Some(tx));
    let callback: FrameCallback = Arc::new(move |frame: Bytes| -> Result<(), TransportError> {
        // Only the first reply is delivered
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(frame);
        }
        Ok(())
    });
    registry.register(ctx, callback)?;

    let timeout = ctx.timeout();
    let result = async {
        send.await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(TransportError::Disconnected(
                "reply channel dropped".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
    .await;

    registry.unregister(ctx);
    result
}
