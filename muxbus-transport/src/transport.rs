//! Transport traits and the shared open/close lifecycle.

use crate::error::TransportError;
use crate::monitor::MonitorSlot;
use async_trait::async_trait;
use bytes::Bytes;
use muxbus_protocol::{Context, FRAME_PREFIX_SIZE};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Open,
}

/// Why a transport left the open state.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Closed by the owner.
    Clean,
    /// Closed by a failure; a monitor may reopen it.
    Unclean(Arc<TransportError>),
}

impl CloseReason {
    pub fn unclean(err: TransportError) -> Self {
        CloseReason::Unclean(Arc::new(err))
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Clean)
    }

    pub fn cause(&self) -> Option<&TransportError> {
        match self {
            CloseReason::Clean => None,
            CloseReason::Unclean(err) => Some(err),
        }
    }
}

/// Receiver side of a transport's close signal.
///
/// Any number of watchers can wait on the same signal. The value is reset on
/// every successful open and set exactly once when that cycle ends.
#[derive(Debug, Clone)]
pub struct CloseWatch {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseWatch {
    /// Waits until the current open cycle ends.
    ///
    /// Returns `None` if the transport was dropped.
    pub async fn wait(&mut self) -> Option<CloseReason> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        }
    }

    /// Returns the close reason of the current cycle, if it has ended.
    pub fn current(&self) -> Option<CloseReason> {
        self.rx.borrow().clone()
    }
}

/// Open/closed state, close signal and monitor slot shared by every transport.
pub struct TransportCore {
    state: RwLock<TransportState>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    monitor: MonitorSlot,
}

impl TransportCore {
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(None);
        Self {
            state: RwLock::new(TransportState::Closed),
            closed_tx,
            monitor: MonitorSlot::new(),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Fails with `NotOpen` unless the transport is open.
    pub fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }

    /// Fails with `AlreadyOpen` if the transport is open.
    pub fn ensure_closed(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Err(TransportError::AlreadyOpen)
        } else {
            Ok(())
        }
    }

    /// Transitions Closed -> Open and starts a new close-signal cycle.
    pub fn mark_open(&self) -> Result<(), TransportError> {
        let mut state = self.state.write();
        if *state == TransportState::Open {
            return Err(TransportError::AlreadyOpen);
        }
        *state = TransportState::Open;
        self.closed_tx.send_replace(None);
        Ok(())
    }

    /// Transitions Open -> Closed and publishes `reason` to every watcher.
    ///
    /// Only the first close of a cycle succeeds; later calls get `AlreadyClosed`.
    pub fn mark_closed(&self, reason: CloseReason) -> Result<(), TransportError> {
        let mut state = self.state.write();
        if *state == TransportState::Closed {
            return Err(TransportError::AlreadyClosed);
        }
        *state = TransportState::Closed;
        match reason.cause() {
            None => tracing::debug!("transport closed cleanly"),
            Some(cause) => tracing::warn!("transport closed uncleanly: {}", cause),
        }
        self.closed_tx.send_replace(Some(reason));
        Ok(())
    }

    pub fn closed(&self) -> CloseWatch {
        CloseWatch {
            rx: self.closed_tx.subscribe(),
        }
    }

    pub fn monitor_slot(&self) -> &MonitorSlot {
        &self.monitor
    }
}

impl Default for TransportCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects frames that are empty or exceed `limit` (0 = unlimited).
pub fn check_frame_size(frame: &[u8], limit: usize) -> Result<(), TransportError> {
    if frame.len() <= FRAME_PREFIX_SIZE {
        return Err(TransportError::EmptyMessage);
    }
    if limit > 0 && frame.len() > limit {
        return Err(TransportError::TooLarge {
            size: frame.len(),
            max: limit,
        });
    }
    Ok(())
}

/// A byte channel with an open/close lifecycle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the transport. A second open fails with `AlreadyOpen`.
    async fn open(&self) -> Result<(), TransportError>;

    /// Closes the transport cleanly. A second close fails with `AlreadyClosed`.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Returns a watcher for the close signal.
    fn closed(&self) -> CloseWatch;

    /// Slot holding the monitor supervising this transport.
    fn monitor_slot(&self) -> &MonitorSlot;
}

/// A transport that carries correlated request/response frames.
#[async_trait]
pub trait RequestTransport: Transport {
    /// Sends a request frame and waits for the matching response frame.
    async fn request(&self, ctx: &Context, frame: Bytes) -> Result<Bytes, TransportError>;

    /// Sends a frame without waiting for a response.
    async fn oneway(&self, ctx: &Context, frame: Bytes) -> Result<(), TransportError>;

    /// Largest frame accepted, prefix included (0 = unlimited).
    fn request_size_limit(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lifecycle() {
        let core = TransportCore::new();
        assert_eq!(core.state(), TransportState::Closed);
        assert!(matches!(core.ensure_open(), Err(TransportError::NotOpen)));

        core.mark_open().unwrap();
        assert!(core.is_open());
        assert!(matches!(core.mark_open(), Err(TransportError::AlreadyOpen)));
        assert!(matches!(core.ensure_closed(), Err(TransportError::AlreadyOpen)));

        core.mark_closed(CloseReason::Clean).unwrap();
        assert!(!core.is_open());
        assert!(matches!(
            core.mark_closed(CloseReason::Clean),
            Err(TransportError::AlreadyClosed)
        ));
    }

    #[test]
    fn test_close_on_never_opened() {
        let core = TransportCore::new();
        assert!(matches!(
            core.mark_closed(CloseReason::Clean),
            Err(TransportError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_signal_published_once_per_cycle() {
        let core = TransportCore::new();
        let mut first = core.closed();
        let mut second = core.closed();

        core.mark_open().unwrap();
        assert!(first.current().is_none());

        core.mark_closed(CloseReason::unclean(TransportError::Disconnected(
            "peer reset".into(),
        )))
        .unwrap();
        // Second close in the same cycle does not overwrite the reason
        let _ = core.mark_closed(CloseReason::Clean);

        let reason = first.wait().await.unwrap();
        assert!(!reason.is_clean());
        assert!(matches!(
            reason.cause(),
            Some(TransportError::Disconnected(_))
        ));
        assert!(!second.wait().await.unwrap().is_clean());

        // A new cycle resets the signal
        core.mark_open().unwrap();
        assert!(first.current().is_none());
        core.mark_closed(CloseReason::Clean).unwrap();
        assert!(first.wait().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_close() {
        let core = Arc::new(TransportCore::new());
        core.mark_open().unwrap();
        let mut watch = core.closed();

        let closer = core.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.mark_closed(CloseReason::Clean).unwrap();
        });

        let reason = tokio::time::timeout(Duration::from_secs(1), watch.wait())
            .await
            .unwrap();
        assert!(reason.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_wait_returns_none_when_dropped() {
        let core = TransportCore::new();
        let mut watch = core.closed();
        drop(core);
        assert!(watch.wait().await.is_none());
    }

    #[test]
    fn test_check_frame_size() {
        assert!(matches!(
            check_frame_size(&[0, 0, 0, 0], 0),
            Err(TransportError::EmptyMessage)
        ));
        assert!(matches!(
            check_frame_size(&[0u8; 20], 16),
            Err(TransportError::TooLarge { size: 20, max: 16 })
        ));
        assert!(check_frame_size(&[0u8; 20], 0).is_ok());
        assert!(check_frame_size(&[0u8; 16], 16).is_ok());
    }
}
