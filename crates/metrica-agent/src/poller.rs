//! Poll loop: samples the allocator and the host into the local repository.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrica_core::repository::MemStorage;
use rand::Rng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::HostSampler;
use crate::runtime;

pub struct Poller {
    repo: Arc<MemStorage>,
    host: HostSampler,
    rng: StdRng,
    polls: u64,
}

impl Poller {
    pub fn new(repo: Arc<MemStorage>, proc_path: impl Into<PathBuf>, rng: StdRng) -> Self {
        Self {
            repo,
            host: HostSampler::new(proc_path),
            rng,
            polls: 0,
        }
    }

    /// Runs one gather cycle.
    pub fn poll_once(&mut self) {
        let sample = runtime::sample();
        let random_value: f64 = self.rng.random();
        self.repo.update_runtime(&sample, random_value);

        let host = self.host.sample();
        let host_count = host.len();
        if let Err(e) = self.repo.update_metrics(host) {
            warn!(error = %e, "failed to store host metrics");
        }

        self.polls += 1;
        debug!(
            poll = self.polls,
            host_metrics = host_count,
            total = self.repo.len(),
            "poll completed"
        );
    }

    /// Polls every `period` until `cancel` fires. The first poll runs immediately.
    pub async fn run(mut self, period: Duration, cancel: CancellationToken) {
        info!(
            period_ms = period.as_millis() as u64,
            proc_path = %self.host.proc_path().display(),
            "poll loop started"
        );
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.poll_once(),
            }
        }
        info!(polls = self.polls, "poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrica_core::MetricValue;
    use metrica_core::models::{POLL_COUNT, RANDOM_VALUE};
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn poller(repo: Arc<MemStorage>, proc: &std::path::Path) -> Poller {
        Poller::new(repo, proc, StdRng::seed_from_u64(7))
    }

    #[test]
    fn poll_fills_repository() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 1000 kB\nMemFree: 400 kB\n").unwrap();
        std::fs::write(dir.path().join("stat"), "cpu 1 0 1 8 0 0 0 0\ncpu0 1 0 1 8 0 0 0 0\n")
            .unwrap();

        let repo = Arc::new(MemStorage::new());
        let mut p = poller(repo.clone(), dir.path());
        p.poll_once();
        p.poll_once();

        assert_eq!(
            repo.get_metric(POLL_COUNT).unwrap().value,
            MetricValue::Counter(2)
        );
        match repo.get_metric(RANDOM_VALUE).unwrap().value {
            MetricValue::Gauge(v) => assert!((0.0..1.0).contains(&v)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            repo.get_metric("TotalMemory").unwrap().value,
            MetricValue::Gauge(1000.0 * 1024.0)
        );
        assert!(repo.get_metric("CPUutilization1").is_ok());
        assert!(repo.get_metric("HeapAlloc").is_ok());
    }

    #[test]
    fn seeded_generator_is_deterministic() {
        let dir = tempdir().unwrap();
        let a = Arc::new(MemStorage::new());
        let b = Arc::new(MemStorage::new());
        poller(a.clone(), dir.path()).poll_once();
        poller(b.clone(), dir.path()).poll_once();
        assert_eq!(
            a.get_metric(RANDOM_VALUE).unwrap(),
            b.get_metric(RANDOM_VALUE).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_polls_until_cancelled() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(MemStorage::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            poller(repo.clone(), dir.path()).run(Duration::from_secs(2), cancel.clone()),
        );

        // Ticks at 0s, 2s, 4s.
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            repo.get_metric(POLL_COUNT).unwrap().value,
            MetricValue::Counter(3)
        );
    }
}
