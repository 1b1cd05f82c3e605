//! Snapshot saver for the in-memory repository.
//!
//! With a zero store interval every successful write is followed by a save;
//! otherwise a background loop saves on each tick. Either way the file is
//! written from the blocking pool and one last save runs at shutdown.
//!
//! Saves are serialised: the repository copy and the file write happen under
//! one lock, so a later save always writes a copy at least as new as any
//! earlier one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrica_core::MetricError;
use metrica_core::repository::MemStorage;
use metrica_core::snapshot::FileSnapshot;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct Saver {
    repo: Arc<MemStorage>,
    file: FileSnapshot,
    interval: Duration,
    save_lock: Mutex<()>,
}

impl Saver {
    pub(crate) fn new(repo: Arc<MemStorage>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            repo,
            file: FileSnapshot::new(path),
            interval,
            save_lock: Mutex::new(()),
        }
    }

    /// True when every write is saved immediately.
    pub(crate) fn is_sync(&self) -> bool {
        self.interval.is_zero()
    }

    /// Loads the snapshot file into the repository. Returns the number of metrics restored.
    pub(crate) fn restore(&self) -> Result<usize, MetricError> {
        let metrics = self.file.load()?;
        let count = metrics.len();
        self.repo.restore(metrics);
        info!(path = %self.file.path().display(), count, "restored metrics from snapshot");
        Ok(count)
    }

    pub(crate) async fn save(&self) -> Result<(), MetricError> {
        let _guard = self.save_lock.lock().await;
        let metrics = self.repo.snapshot();
        let count = metrics.len();
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.save(&metrics))
            .await
            .map_err(|e| MetricError::Backend(format!("snapshot task failed: {e}")))??;
        debug!(path = %self.file.path().display(), count, "snapshot saved");
        Ok(())
    }

    /// Called after every successful write. Saves only in sync mode; failures are logged.
    pub(crate) async fn on_write(&self) {
        if !self.is_sync() {
            return;
        }
        if let Err(e) = self.save().await {
            warn!(path = %self.file.path().display(), error = %e, "snapshot save failed");
        }
    }

    /// Saves on every tick until cancelled. Returns immediately in sync mode.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.is_sync() {
            return;
        }
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.save().await {
                        warn!(path = %self.file.path().display(), error = %e, "periodic snapshot failed");
                    }
                }
            }
        }
        debug!("snapshot loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrica_core::{Metric, MetricValue};
    use tempfile::tempdir;

    #[tokio::test]
    async fn sync_mode_saves_after_each_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.json");
        let repo = Arc::new(MemStorage::new());
        let saver = Saver::new(repo.clone(), &path, Duration::ZERO);
        assert!(saver.is_sync());

        repo.set_metric(Metric::counter("hits", 2)).unwrap();
        saver.on_write().await;
        repo.set_metric(Metric::counter("hits", 2)).unwrap();
        saver.on_write().await;

        let restored = Arc::new(MemStorage::new());
        Saver::new(restored.clone(), &path, Duration::ZERO)
            .restore()
            .unwrap();
        assert_eq!(
            restored.get_metric("hits").unwrap().value,
            MetricValue::Counter(4)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sync_saves_keep_every_write() {
        for round in 0..10 {
            let dir = tempdir().unwrap();
            let path = dir.path().join("s.json");
            let repo = Arc::new(MemStorage::new());
            let saver = Arc::new(Saver::new(repo.clone(), &path, Duration::ZERO));

            let writers: Vec<_> = (0..64)
                .map(|i| {
                    let repo = repo.clone();
                    let saver = saver.clone();
                    tokio::spawn(async move {
                        repo.set_metric(Metric::gauge(format!("g{i}"), 1.0)).unwrap();
                        saver.on_write().await;
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap();
            }

            let on_disk = FileSnapshot::new(&path).load().unwrap();
            assert_eq!(on_disk.len(), repo.len(), "round {round}");
        }
    }

    #[tokio::test]
    async fn interval_mode_does_not_save_on_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.json");
        let repo = Arc::new(MemStorage::new());
        let saver = Saver::new(repo.clone(), &path, Duration::from_secs(300));

        repo.set_metric(Metric::gauge("temp", 1.0)).unwrap();
        saver.on_write().await;
        assert!(!path.exists());

        saver.save().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn restore_from_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(MemStorage::new());
        let saver = Saver::new(repo.clone(), dir.path().join("none.json"), Duration::ZERO);
        assert_eq!(saver.restore().unwrap(), 0);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn loop_saves_periodically_and_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.json");
        let repo = Arc::new(MemStorage::new());
        repo.set_metric(Metric::gauge("temp", 3.5)).unwrap();
        let saver = Arc::new(Saver::new(repo, &path, Duration::from_millis(50)));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(saver.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(path.exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
