//! Transport configuration sections.

use muxbus_protocol::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multiplexed transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Number of frame workers (minimum 1).
    pub workers: usize,
    /// Capacity of the work queue between the read loop and the workers.
    pub queue_len: usize,
    /// Queue residency above which a warning is logged.
    pub watermark_ms: u64,
    /// Largest frame accepted on the stream, prefix included (0 = unlimited).
    pub max_frame_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_len: 64,
            watermark_ms: 5000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl MuxConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }

    pub fn with_watermark(mut self, watermark: Duration) -> Self {
        self.watermark_ms = watermark.as_millis() as u64;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn watermark(&self) -> Duration {
        Duration::from_millis(self.watermark_ms)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(workers) = std::env::var("MUXBUS_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.workers = n;
            }
        }

        if let Ok(len) = std::env::var("MUXBUS_QUEUE_LEN") {
            if let Ok(n) = len.parse() {
                self.queue_len = n;
            }
        }

        if let Ok(ms) = std::env::var("MUXBUS_WATERMARK_MS") {
            if let Ok(n) = ms.parse() {
                self.watermark_ms = n;
            }
        }

        if let Ok(max) = std::env::var("MUXBUS_MAX_FRAME_SIZE") {
            if let Ok(n) = max.parse() {
                self.max_frame_size = n;
            }
        }
    }
}

/// Reopen policy for [`BackoffMonitor`](crate::monitor::BackoffMonitor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reopen attempts before giving up (0 disables reopening).
    pub max_attempts: u32,
    pub initial_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_wait_ms: 2000,
            max_wait_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("MUXBUS_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(n) = max.parse() {
                self.max_attempts = n;
            }
        }

        if let Ok(ms) = std::env::var("MUXBUS_RECONNECT_INITIAL_WAIT_MS") {
            if let Ok(n) = ms.parse() {
                self.initial_wait_ms = n;
            }
        }

        if let Ok(ms) = std::env::var("MUXBUS_RECONNECT_MAX_WAIT_MS") {
            if let Ok(n) = ms.parse() {
                self.max_wait_ms = n;
            }
        }
    }
}
