//! One-shot rate-limited worker pool.
//!
//! Tasks are queued up front, then `run` starts up to `workers` consumers
//! sharing one job channel and one token-bucket limiter. A consumer takes a
//! job and its limiter token under the same lock, so tasks start in the
//! order they were submitted and the global start rate never exceeds the
//! configured limit. Errors come back on the returned channel, which closes
//! once every task has finished.

use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// A unit of work. The task itself must observe cancellation; the pool never preempts.
pub type Task<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Builds a limiter releasing one permit every `1 / rate` seconds, with no burst.
pub fn rate_quota(rate: NonZeroU32) -> Quota {
    Quota::with_period(Duration::from_secs(1) / rate.get())
        .unwrap_or_else(|| Quota::per_second(rate))
        .allow_burst(NonZeroU32::MIN)
}

pub struct WorkerPool<E> {
    workers: usize,
    limiter: Arc<DirectLimiter>,
    tasks: Vec<Task<E>>,
}

impl<E: Send + 'static> WorkerPool<E> {
    /// A pool with `workers` consumers (at least one) limited to `rate` task starts per second.
    pub fn new(workers: usize, rate: NonZeroU32) -> Self {
        Self {
            workers: workers.max(1),
            limiter: Arc::new(RateLimiter::direct(rate_quota(rate))),
            tasks: Vec::new(),
        }
    }

    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.tasks.push(Box::pin(task));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Starts the consumers and returns the error channel.
    ///
    /// Must be called inside a tokio runtime. Consumes the pool, so a pool
    /// runs at most once.
    pub fn run(self) -> mpsc::Receiver<E> {
        let total = self.tasks.len();
        let (job_tx, job_rx) = mpsc::channel::<Task<E>>(total.max(1));
        let (err_tx, err_rx) = mpsc::channel::<E>(total.max(1));

        for task in self.tasks {
            // Capacity equals the task count, so this never fails.
            if job_tx.try_send(task).is_err() {
                break;
            }
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers = self.workers.min(total);
        debug!(tasks = total, workers, "worker pool started");

        for id in 0..workers {
            let job_rx = job_rx.clone();
            let err_tx = err_tx.clone();
            let limiter = self.limiter.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        let job = rx.recv().await;
                        if job.is_some() {
                            limiter.until_ready().await;
                        }
                        job
                    };
                    let Some(job) = job else { break };
                    if let Err(e) = job.await {
                        let _ = err_tx.send(e).await;
                    }
                }
                debug!(worker = id, "worker finished");
            });
        }
        err_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn rate(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    async fn drain<E>(mut rx: mpsc::Receiver<E>) -> Vec<E> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn errors_are_reported_and_channel_closes() {
        let mut pool = WorkerPool::new(3, rate(1000));
        for i in 0..6u32 {
            pool.submit(async move { if i % 2 == 0 { Err(i) } else { Ok(()) } });
        }
        assert_eq!(pool.len(), 6);

        let mut errors = drain(pool.run()).await;
        errors.sort();
        assert_eq!(errors, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn empty_pool_closes_immediately() {
        let pool: WorkerPool<String> = WorkerPool::new(4, rate(1));
        assert!(pool.is_empty());
        assert!(drain(pool.run()).await.is_empty());
    }

    #[tokio::test]
    async fn tasks_start_in_submission_order() {
        let started = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut pool: WorkerPool<()> = WorkerPool::new(3, rate(50));
        for i in 0..8 {
            let started = started.clone();
            pool.submit(async move {
                started.lock().push(i);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(())
            });
        }
        drain(pool.run()).await;
        assert_eq!(*started.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn start_rate_is_limited() {
        let starts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut pool: WorkerPool<()> = WorkerPool::new(4, rate(4));
        for _ in 0..6 {
            let starts = starts.clone();
            pool.submit(async move {
                starts.lock().push(Instant::now());
                Ok(())
            });
        }
        drain(pool.run()).await;

        let starts = starts.lock().clone();
        assert_eq!(starts.len(), 6);
        for (i, first) in starts.iter().enumerate() {
            let in_window = starts[i..]
                .iter()
                .filter(|t| t.duration_since(*first) < Duration::from_millis(950))
                .count();
            assert!(in_window <= 4, "{in_window} task starts within one second");
        }
        assert!(starts[5].duration_since(starts[0]) >= Duration::from_millis(1200));
    }

    #[test]
    fn quota_has_no_burst() {
        let quota = rate_quota(rate(10));
        assert_eq!(quota.burst_size().get(), 1);
        assert_eq!(quota.replenish_interval(), Duration::from_millis(100));
    }
}
