//! Bounded worker pool with a queue-residency watermark.

use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Work executed by pool workers.
#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, item: T);
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub submitted: AtomicU64,
    pub processed: AtomicU64,
    /// Jobs that waited in the queue longer than the watermark.
    pub over_watermark: AtomicU64,
}

impl PoolStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn over_watermark(&self) -> u64 {
        self.over_watermark.load(Ordering::Relaxed)
    }
}

struct Job<T> {
    item: T,
    queued_at: Instant,
}

/// Fixed set of workers draining a bounded queue.
///
/// A full queue applies backpressure to `submit`. Jobs that sit in the queue
/// longer than the watermark are logged and counted, never dropped.
pub struct WorkerPool<T> {
    tx: Mutex<Option<mpsc::Sender<Job<T>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `workers` tasks (at least one) over a queue of `queue_len` jobs.
    pub fn start(
        workers: usize,
        queue_len: usize,
        watermark: Duration,
        handler: Arc<dyn JobHandler<T>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job<T>>(queue_len.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let handler = handler.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };

                        let waited = job.queued_at.elapsed();
                        if waited > watermark {
                            stats.over_watermark.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                "worker {}: job waited {:?} in queue (watermark {:?})",
                                id,
                                waited,
                                watermark
                            );
                        }

                        handler.handle(job.item).await;
                        stats.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::trace!("worker {} exiting", id);
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            stats,
        }
    }

    /// Queues `item`, waiting for space if the queue is full.
    pub async fn submit(&self, item: T) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone().ok_or(TransportError::NotOpen)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        tx.send(Job {
            item,
            queued_at: Instant::now(),
        })
        .await
        .map_err(|_| TransportError::NotOpen)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn stats_handle(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Stops accepting jobs. Workers finish what is already queued and exit.
    ///
    /// Safe to call from inside a job.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        self.workers.lock().clear();
    }

    /// Stops accepting jobs and waits for every worker to exit.
    ///
    /// Must not be called from inside a job.
    pub async fn join(&self) {
        self.tx.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        seen: Mutex<Vec<u32>>,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler<u32> for Collect {
        async fn handle(&self, item: u32) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().push(item);
        }
    }

    fn collector(delay: Duration) -> Arc<Collect> {
        Arc::new(Collect {
            seen: Mutex::new(Vec::new()),
            delay,
        })
    }

    #[tokio::test]
    async fn test_all_jobs_processed() {
        let handler = collector(Duration::ZERO);
        let pool = WorkerPool::<u32>::start(4, 8, Duration::from_secs(5), handler.clone());

        for i in 0..100u32 {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;

        let mut seen = handler.seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<u32>>());
        assert_eq!(pool.stats().submitted(), 100);
        assert_eq!(pool.stats().processed(), 100);
    }

    #[tokio::test]
    async fn test_zero_workers_clamped_to_one() {
        let handler = collector(Duration::ZERO);
        let pool = WorkerPool::<u32>::start(0, 0, Duration::from_secs(5), handler.clone());
        pool.submit(7).await.unwrap();
        pool.join().await;
        assert_eq!(*handler.seen.lock(), vec![7]);
    }

    #[tokio::test]
    async fn test_watermark_is_advisory() {
        let handler = collector(Duration::from_millis(2));
        let pool = WorkerPool::<u32>::start(1, 16, Duration::ZERO, handler.clone());

        for i in 0..10u32 {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;

        // Late jobs are counted but still run
        assert_eq!(handler.seen.lock().len(), 10);
        assert!(pool.stats().over_watermark() > 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = WorkerPool::<u32>::start(1, 1, Duration::from_secs(1), collector(Duration::ZERO));
        pool.shutdown();
        assert!(!pool.is_running());
        assert!(matches!(pool.submit(1).await, Err(TransportError::NotOpen)));
    }
}
