//! Broker transport configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest message the broker transports accept, framing included (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Broker transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Largest frame published or accepted, prefix included.
    pub max_message_size: usize,
    /// Workers serving requests in a [`BrokerServer`](crate::BrokerServer).
    pub workers: usize,
    pub queue_len: usize,
    /// Queue residency above which the server logs a warning.
    pub watermark_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            workers: 4,
            queue_len: 64,
            watermark_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn watermark(&self) -> Duration {
        Duration::from_millis(self.watermark_ms)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_watermark(mut self, watermark: Duration) -> Self {
        self.watermark_ms = watermark.as_millis() as u64;
        self
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("MUXBUS_BROKER_MAX_MESSAGE_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_message_size = n;
            }
        }

        if let Ok(workers) = std::env::var("MUXBUS_BROKER_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.workers = n;
            }
        }
    }
}
