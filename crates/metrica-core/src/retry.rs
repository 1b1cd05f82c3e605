//! Retry policy for backend operations.
//!
//! Only errors classified as transient are retried. The wait schedule is
//! linear: 1s, 3s, 5s by default. Cancellation aborts a pending wait.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::MetricError;

/// Linear backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub retries: u32,
    /// Wait before the first retry.
    pub first_delay: Duration,
    /// Added to the wait before each subsequent retry.
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_secs(1),
            step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Returns the wait before each retry, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let first = self.first_delay;
        let step = self.step;
        (0..self.retries).map(move |i| first + step * i)
    }

    /// Runs `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// On exhaustion the last error is wrapped in `RetriesExhausted`. If
    /// `cancel` fires during a wait, the last error is returned as is.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, MetricError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MetricError>>,
    {
        let mut delays = self.delays();
        let mut attempt: u32 = 1;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            let Some(delay) = delays.next() else {
                return Err(MetricError::RetriesExhausted(Box::new(err)));
            };

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient backend error, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn default_schedule_is_linear() {
        let delays: Vec<u64> = RetryPolicy::default()
            .delays()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = Instant::now();

        let result = RetryPolicy::default()
            .run(&CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MetricError::Transient("connection reset".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 3s of waiting before the third attempt.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MetricError::Backend("syntax error".into())) }
            })
            .await;

        assert!(matches!(result, Err(MetricError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(&CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(MetricError::Transient(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(MetricError::RetriesExhausted(last)) => {
                assert_eq!(last.to_string(), "transient backend error: attempt 3");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MetricError::Transient("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(MetricError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
