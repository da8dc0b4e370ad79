//! Multiplexed stream transport.
//!
//! One read loop slices the byte stream into length-prefixed frames and hands
//! each frame to a worker pool. Workers run the bound [`Registry`] and write
//! any response frame back on the same stream. Frames from many concurrent
//! calls share the connection; the registry's op-id keying routes each reply
//! to its own caller.

use crate::config::MuxConfig;
use crate::error::TransportError;
use crate::monitor::MonitorSlot;
use crate::pool::{JobHandler, PoolStats, WorkerPool};
use crate::registry::{await_reply, Registry};
use crate::transport::{
    check_frame_size, CloseReason, CloseWatch, RequestTransport, Transport, TransportCore,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use muxbus_protocol::{Context, FRAME_PREFIX_SIZE};
use std::collections::VecDeque;
use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Produces the byte stream a [`MultiplexedTransport`] runs over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> Result<Self::Stream, TransportError>;
}

/// Connects to a TCP address on every open.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        tracing::debug!("Connecting to {}...", self.addr);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Hands out pre-established streams, one per open.
///
/// Used for accepted server-side sockets and in-process duplex pipes.
pub struct StreamConnector<S> {
    streams: parking_lot::Mutex<VecDeque<S>>,
}

impl<S> StreamConnector<S> {
    pub fn new(stream: S) -> Self {
        Self {
            streams: parking_lot::Mutex::new(VecDeque::from([stream])),
        }
    }

    pub fn empty() -> Self {
        Self {
            streams: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a stream for the next open.
    pub fn push(&self, stream: S) {
        self.streams.lock().push_back(stream);
    }
}

#[async_trait]
impl<S> Connector for StreamConnector<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Stream = S;

    async fn connect(&self) -> Result<S, TransportError> {
        self.streams
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Disconnected("no stream available".to_string()))
    }
}

/// Resources of one open cycle.
///
/// Every task an open starts holds its own cycle. A task that outlives its
/// cycle only ever reaches that cycle's writer and pool.
struct Cycle<S> {
    writer: Mutex<Option<WriteHalf<S>>>,
    pool: parking_lot::Mutex<Option<Arc<WorkerPool<Bytes>>>>,
    stop: watch::Sender<bool>,
}

impl<S> Cycle<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn new(writer: WriteHalf<S>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            writer: Mutex::new(Some(writer)),
            pool: parking_lot::Mutex::new(None),
            stop,
        }
    }

    /// Writes one full frame and flushes.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotOpen)?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Stops the read loop and the workers. Queued frames still run.
    fn halt(&self) {
        self.stop.send_replace(true);
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
    }

    async fn shutdown(&self) {
        self.halt();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("writer shutdown failed: {}", e);
            }
        }
    }
}

/// State shared between the transport handle, its read loops and its workers.
struct Shared<S> {
    core: TransportCore,
    registry: Arc<dyn Registry>,
    current: parking_lot::Mutex<Option<Arc<Cycle<S>>>>,
}

impl<S> Shared<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn current(&self) -> Result<Arc<Cycle<S>>, TransportError> {
        self.current.lock().clone().ok_or(TransportError::NotOpen)
    }

    /// Ends the open cycle and publishes `reason`.
    ///
    /// With `expected` set, nothing happens unless that cycle is still the
    /// current one. Without it, whichever cycle is current ends.
    async fn end_cycle(
        &self,
        expected: Option<&Arc<Cycle<S>>>,
        reason: CloseReason,
    ) -> Result<(), TransportError> {
        let cycle = {
            let mut current = self.current.lock();
            if let Some(expected) = expected {
                if !matches!(current.as_ref(), Some(c) if Arc::ptr_eq(c, expected)) {
                    tracing::debug!("finished cycle failed after its close, ignoring");
                    return Ok(());
                }
            }
            self.core.mark_closed(reason)?;
            current.take()
        };

        if let Some(cycle) = cycle {
            cycle.shutdown().await;
        }
        Ok(())
    }
}

struct FrameWorker<S> {
    shared: Arc<Shared<S>>,
    cycle: Arc<Cycle<S>>,
}

#[async_trait]
impl<S> JobHandler<Bytes> for FrameWorker<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn handle(&self, frame: Bytes) {
        let result = match self.shared.registry.execute(frame).await {
            Ok(Some(response)) => self.cycle.write_frame(&response).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(err) = result {
            tracing::error!("frame handling failed, closing transport: {}", err);
            let _ = self
                .shared
                .end_cycle(Some(&self.cycle), CloseReason::unclean(err))
                .await;
        }
    }
}

/// Reads frames until the stream fails. Never returns `Ok`.
async fn read_frames<R>(
    reader: &mut R,
    pool: &WorkerPool<Bytes>,
    max_frame_size: usize,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        reader.read_exact(&mut prefix).await.map_err(read_error)?;

        let size = FRAME_PREFIX_SIZE + u32::from_be_bytes(prefix) as usize;
        if max_frame_size > 0 && size > max_frame_size {
            return Err(TransportError::TooLarge {
                size,
                max: max_frame_size,
            });
        }

        let mut frame = BytesMut::with_capacity(size);
        frame.put_slice(&prefix);
        frame.resize(size, 0);
        reader
            .read_exact(&mut frame[FRAME_PREFIX_SIZE..])
            .await
            .map_err(read_error)?;

        tracing::trace!("read frame of {} bytes", size);
        pool.submit(frame.freeze()).await?;
    }
}

fn read_error(err: std::io::Error) -> TransportError {
    if err.kind() == IoErrorKind::UnexpectedEof {
        TransportError::Disconnected("connection closed by peer".to_string())
    } else {
        TransportError::Io(err)
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn read_loop<S>(
    shared: Arc<Shared<S>>,
    cycle: Arc<Cycle<S>>,
    mut reader: ReadHalf<S>,
    pool: Arc<WorkerPool<Bytes>>,
    max_frame_size: usize,
    mut stop: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tracing::debug!("read_loop started");
    let result = tokio::select! {
        result = read_frames(&mut reader, &pool, max_frame_size) => result,
        _ = stopped(&mut stop) => {
            tracing::debug!("read_loop: cycle stopped");
            return;
        }
    };

    if let Err(err) = result {
        tracing::debug!("read_loop: {}", err);
        let _ = shared
            .end_cycle(Some(&cycle), CloseReason::unclean(err))
            .await;
    }
}

/// Transport that multiplexes framed calls over one byte stream.
///
/// The registry is bound at construction: a [`ClientRegistry`] for the calling
/// side, a [`ServerRegistry`] for the serving side.
///
/// [`ClientRegistry`]: crate::registry::ClientRegistry
/// [`ServerRegistry`]: crate::registry::ServerRegistry
pub struct MultiplexedTransport<C: Connector> {
    connector: C,
    config: MuxConfig,
    shared: Arc<Shared<C::Stream>>,
    lifecycle: Mutex<()>,
}

impl<C: Connector> MultiplexedTransport<C> {
    pub fn new(connector: C, registry: Arc<dyn Registry>, config: MuxConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(Shared {
                core: TransportCore::new(),
                registry,
                current: parking_lot::Mutex::new(None),
            }),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Counters of the current open cycle's worker pool.
    pub fn pool_stats(&self) -> Option<Arc<PoolStats>> {
        let current = self.shared.current.lock();
        let pool = current.as_ref()?.pool.lock();
        pool.as_ref().map(|pool| pool.stats_handle())
    }

    /// Sends one full frame without waiting for a reply.
    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let cycle = self.shared.current()?;
        check_frame_size(frame, self.config.max_frame_size)?;
        cycle.write_frame(frame).await
    }
}

#[async_trait]
impl<C: Connector> Transport for MultiplexedTransport<C> {
    async fn open(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.shared.core.ensure_closed()?;

        let stream = self.connector.connect().await?;
        let (reader, writer) = tokio::io::split(stream);
        let cycle = Arc::new(Cycle::new(writer));

        let handler = Arc::new(FrameWorker {
            shared: self.shared.clone(),
            cycle: cycle.clone(),
        });
        let pool = Arc::new(WorkerPool::start(
            self.config.workers,
            self.config.queue_len,
            self.config.watermark(),
            handler,
        ));
        *cycle.pool.lock() = Some(pool.clone());
        let stop = cycle.stop.subscribe();

        {
            let mut current = self.shared.current.lock();
            if let Err(e) = self.shared.core.mark_open() {
                cycle.halt();
                return Err(e);
            }
            *current = Some(cycle.clone());
        }

        tokio::spawn(read_loop(
            self.shared.clone(),
            cycle,
            reader,
            pool,
            self.config.max_frame_size,
            stop,
        ));

        tracing::debug!(
            "multiplexed transport open ({} workers)",
            self.config.workers.max(1)
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.shared.end_cycle(None, CloseReason::Clean).await
    }

    fn is_open(&self) -> bool {
        self.shared.core.is_open()
    }

    fn closed(&self) -> CloseWatch {
        self.shared.core.closed()
    }

    fn monitor_slot(&self) -> &MonitorSlot {
        self.shared.core.monitor_slot()
    }
}

#[async_trait]
impl<C: Connector> RequestTransport for MultiplexedTransport<C> {
    async fn request(&self, ctx: &Context, frame: Bytes) -> Result<Bytes, TransportError> {
        let cycle = self.shared.current()?;
        check_frame_size(&frame, self.config.max_frame_size)?;
        await_reply(
            self.shared.registry.as_ref(),
            ctx,
            cycle.write_frame(&frame),
        )
        .await
    }

    async fn oneway(&self, _ctx: &Context, frame: Bytes) -> Result<(), TransportError> {
        self.send(&frame).await
    }

    fn request_size_limit(&self) -> usize {
        self.config.max_frame_size
    }
}

impl<C: Connector> Drop for MultiplexedTransport<C> {
    fn drop(&mut self) {
        // No close is published: watchers see the drop once the cycle's
        // tasks exit and release the core
        if let Some(cycle) = self.shared.current.lock().take() {
            cycle.halt();
        }
    }
}
