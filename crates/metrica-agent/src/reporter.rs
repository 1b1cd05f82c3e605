//! Report loop: drains the local repository through a fresh worker pool each cycle.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use metrica_core::pool::WorkerPool;
use metrica_core::repository::MemStorage;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::netaddr;
use crate::sender::{SendError, Transport};

pub struct Reporter {
    repo: Arc<MemStorage>,
    transport: Transport,
    workers: usize,
    rate_limit: NonZeroU32,
}

/// Outcome of one report cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub tasks: usize,
    pub failed: usize,
}

impl Reporter {
    pub fn new(
        repo: Arc<MemStorage>,
        transport: Transport,
        workers: usize,
        rate_limit: NonZeroU32,
    ) -> Self {
        Self {
            repo,
            transport,
            workers,
            rate_limit,
        }
    }

    /// Sends the current repository contents once and waits for every task.
    ///
    /// Failures are logged and dropped; nothing is queued for the next cycle.
    pub async fn report_once(&self, cancel: &CancellationToken) -> CycleStats {
        let metrics = self.repo.snapshot();
        if metrics.is_empty() {
            debug!("nothing to report");
            return CycleStats::default();
        }

        let ip = netaddr::outbound_ip();
        let mut pool: WorkerPool<SendError> = WorkerPool::new(self.workers, self.rate_limit);

        match &self.transport {
            Transport::Http(sender) => {
                let payloads = match sender.payloads(&metrics) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to encode report");
                        return CycleStats {
                            tasks: 0,
                            failed: 1,
                        };
                    }
                };
                for payload in payloads {
                    let sender = sender.clone();
                    let cancel = cancel.clone();
                    pool.submit(async move { sender.send(payload, ip, &cancel).await });
                }
            }
            Transport::Grpc(sender) => {
                for metric in metrics {
                    let sender = sender.clone();
                    let cancel = cancel.clone();
                    pool.submit(async move { sender.send(&metric, ip, &cancel).await });
                }
            }
        }

        let tasks = pool.len();
        let mut errors = pool.run();
        let mut failed = 0;
        while let Some(e) = errors.recv().await {
            failed += 1;
            warn!(error = %e, "report request failed");
        }

        debug!(tasks, failed, %ip, "report cycle finished");
        CycleStats { tasks, failed }
    }

    /// Reports every `period` until `cancel` fires. A cycle in flight when the
    /// token fires runs to completion; its requests observe the token.
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        info!(period_ms = period.as_millis() as u64, "report loop started");
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycles: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let stats = self.report_once(&cancel).await;
            cycles += 1;
            if stats.failed > 0 {
                warn!(cycle = cycles, tasks = stats.tasks, failed = stats.failed, "report cycle had failures");
            }
        }
        info!(cycles, "report loop stopped");
    }
}
