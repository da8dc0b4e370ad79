//! Transport supervision and reopen with backoff.
//!
//! A monitor watches one transport's close signal. A clean close ends
//! supervision. An unclean close asks the [`TransportMonitor`] policy whether
//! to reopen and how long to wait, then retries `open()` until the policy
//! gives up or a reopen succeeds, after which supervision resumes.

use crate::config::ReconnectConfig;
use crate::error::TransportError;
use crate::transport::{CloseReason, CloseWatch, Transport};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Reopen policy and lifecycle callbacks.
pub trait TransportMonitor: Send + Sync {
    /// Called when the transport was closed by its owner. Supervision ends.
    fn on_closed_cleanly(&self);

    /// Called on an unclean close. Returns the wait before the first reopen,
    /// or `None` to stop supervising.
    fn on_closed_uncleanly(&self, cause: &TransportError) -> Option<Duration>;

    /// Called after a failed reopen. Returns the next wait, or `None` to give up.
    fn on_reopen_failed(&self, prev_attempts: u32, prev_wait: Duration) -> Option<Duration>;

    /// Called after a successful reopen.
    fn on_reopen_succeeded(&self);
}

/// Exponential backoff policy: the wait doubles after every failure, capped
/// at `max_wait`, for at most `max_attempts` reopen attempts.
#[derive(Debug, Clone)]
pub struct BackoffMonitor {
    max_attempts: u32,
    initial_wait: Duration,
    max_wait: Duration,
}

impl BackoffMonitor {
    pub fn new(max_attempts: u32, initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            initial_wait,
            max_wait,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.max_attempts, config.initial_wait(), config.max_wait())
    }
}

impl Default for BackoffMonitor {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl TransportMonitor for BackoffMonitor {
    fn on_closed_cleanly(&self) {
        tracing::info!("transport closed cleanly, monitor exiting");
    }

    fn on_closed_uncleanly(&self, cause: &TransportError) -> Option<Duration> {
        if self.max_attempts == 0 {
            tracing::warn!("transport closed uncleanly ({}), reopen disabled", cause);
            return None;
        }
        tracing::info!(
            "transport closed uncleanly ({}), reopening in {:?}",
            cause,
            self.initial_wait
        );
        Some(self.initial_wait)
    }

    fn on_reopen_failed(&self, prev_attempts: u32, prev_wait: Duration) -> Option<Duration> {
        if prev_attempts >= self.max_attempts {
            tracing::error!("giving up after {} reopen attempts", prev_attempts);
            return None;
        }
        Some(prev_wait.saturating_mul(2).min(self.max_wait))
    }

    fn on_reopen_succeeded(&self) {
        tracing::info!("transport reopened");
    }
}

/// Why a supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The transport was closed cleanly.
    ClosedCleanly,
    /// The policy declined to reopen, or ran out of attempts.
    GaveUp,
    /// Replaced by another monitor or detached.
    Stopped,
    /// The transport was dropped.
    TransportDropped,
}

/// Handle to a running supervisor.
pub struct MonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    /// Sends the stop signal and returns the supervisor task.
    pub fn stop(mut self) -> JoinHandle<MonitorExit> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task
    }

    /// Waits for the supervisor to exit on its own.
    pub async fn join(self) -> Option<MonitorExit> {
        let MonitorHandle { stop, task } = self;
        let exit = task.await.ok();
        drop(stop);
        exit
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Holds the monitor currently attached to a transport.
#[derive(Default)]
pub struct MonitorSlot {
    current: Mutex<Option<MonitorHandle>>,
}

impl MonitorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a supervisor is attached and still running.
    pub fn is_attached(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Detaches the current supervisor without stopping it.
    pub fn take(&self) -> Option<MonitorHandle> {
        self.current.lock().take()
    }
}

/// Attaches `monitor` to `transport`.
///
/// A previously attached supervisor receives a stop signal before the new one
/// starts; its task is returned so the caller can await its exit. Must be
/// called from within a tokio runtime.
pub fn attach<T>(
    transport: &Arc<T>,
    monitor: Arc<dyn TransportMonitor>,
) -> Option<JoinHandle<MonitorExit>>
where
    T: Transport + ?Sized + 'static,
{
    let mut current = transport.monitor_slot().current.lock();
    let displaced = current.take().map(MonitorHandle::stop);
    if displaced.is_some() {
        tracing::debug!("stopping displaced transport monitor");
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(supervise(
        Arc::downgrade(transport),
        transport.closed(),
        monitor,
        stop_rx,
    ));
    *current = Some(MonitorHandle {
        stop: Some(stop_tx),
        task,
    });
    displaced
}

/// The stop sender lives in the transport's slot, so it also goes away when
/// the transport is dropped with the monitor still attached.
fn stop_exit<T: ?Sized>(
    signal: Result<(), oneshot::error::RecvError>,
    transport: &Weak<T>,
) -> MonitorExit {
    match signal {
        Err(_) if transport.strong_count() == 0 => MonitorExit::TransportDropped,
        _ => MonitorExit::Stopped,
    }
}

async fn supervise<T>(
    transport: Weak<T>,
    mut watch: CloseWatch,
    monitor: Arc<dyn TransportMonitor>,
    mut stop: oneshot::Receiver<()>,
) -> MonitorExit
where
    T: Transport + ?Sized,
{
    loop {
        let reason = tokio::select! {
            signal = &mut stop => return stop_exit(signal, &transport),
            reason = watch.wait() => reason,
        };

        let cause = match reason {
            None => return MonitorExit::TransportDropped,
            Some(CloseReason::Clean) => {
                monitor.on_closed_cleanly();
                return MonitorExit::ClosedCleanly;
            }
            Some(CloseReason::Unclean(cause)) => cause,
        };

        let Some(mut wait) = monitor.on_closed_uncleanly(&cause) else {
            return MonitorExit::GaveUp;
        };

        let mut attempts = 0u32;
        loop {
            tokio::select! {
                signal = &mut stop => return stop_exit(signal, &transport),
                _ = tokio::time::sleep(wait) => {}
            }

            attempts += 1;
            let Some(transport) = transport.upgrade() else {
                return MonitorExit::TransportDropped;
            };

            match transport.open().await {
                Ok(()) | Err(TransportError::AlreadyOpen) => {
                    monitor.on_reopen_succeeded();
                    break;
                }
                Err(e) => {
                    tracing::warn!("reopen attempt {} failed: {}", attempts, e);
                    match monitor.on_reopen_failed(attempts, wait) {
                        Some(next) => wait = next,
                        None => return MonitorExit::GaveUp,
                    }
                }
            }
        }
    }
}
