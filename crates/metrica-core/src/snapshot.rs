//! JSON file snapshot of the in-memory repository.
//!
//! File format (pretty-printed):
//!
//! ```json
//! {
//!   "metrics": {
//!     "hits": { "type": "counter", "value": 4 },
//!     "temp": { "type": "gauge", "value": 3.5 }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::MetricError;
use crate::models::{Metric, MetricKind, MetricValue, number_to_counter};

#[derive(Serialize, Deserialize, Default)]
struct SnapshotFile {
    metrics: BTreeMap<String, StoredMetric>,
}

#[derive(Serialize, Deserialize)]
struct StoredMetric {
    #[serde(rename = "type")]
    kind: MetricKind,
    value: serde_json::Number,
}

impl StoredMetric {
    fn from_value(value: MetricValue) -> Result<Self, MetricError> {
        let number = match value {
            MetricValue::Counter(v) => serde_json::Number::from(v),
            MetricValue::Gauge(v) => serde_json::Number::from_f64(v).ok_or_else(|| {
                MetricError::validation(format!("gauge value {v} cannot be stored as JSON"))
            })?,
        };
        Ok(Self {
            kind: value.kind(),
            value: number,
        })
    }

    fn into_value(self) -> Result<MetricValue, MetricError> {
        match self.kind {
            MetricKind::Counter => number_to_counter(&self.value).map(MetricValue::Counter),
            MetricKind::Gauge => self
                .value
                .as_f64()
                .map(MetricValue::Gauge)
                .ok_or_else(|| MetricError::parse(format!("invalid gauge value {}", self.value))),
        }
    }
}

/// Snapshot file on disk. Cloning shares the write lock, so concurrent
/// saves through any clone are serialised.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every metric to the file: truncate, rewind, encode.
    ///
    /// Gauges that JSON cannot represent (NaN, infinities) are skipped.
    pub fn save(&self, metrics: &[Metric]) -> Result<(), MetricError> {
        let mut snapshot = SnapshotFile::default();
        for metric in metrics {
            match StoredMetric::from_value(metric.value) {
                Ok(stored) => {
                    snapshot.metrics.insert(metric.name.clone(), stored);
                }
                Err(e) => tracing::warn!(metric = %metric.name, error = %e, "skipping metric in snapshot"),
            }
        }

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;

        let mut writer = BufWriter::new(&mut file);
        serde_json::to_writer_pretty(&mut writer, &snapshot)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);
        file.sync_data()?;
        Ok(())
    }

    /// Reads the file back. A missing or empty file means no prior state.
    pub fn load(&self) -> Result<Vec<Metric>, MetricError> {
        let _guard = self.lock.lock();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }

        let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))?;
        snapshot
            .metrics
            .into_iter()
            .map(|(name, stored)| {
                Ok(Metric {
                    value: stored.into_value()?,
                    name,
                })
            })
            .collect()
    }
}
