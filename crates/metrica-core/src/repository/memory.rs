//! In-memory repository guarded by a single reader/writer lock.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Repository;
use crate::error::MetricError;
use crate::models::{Metric, MetricValue, POLL_COUNT, RANDOM_VALUE, RuntimeSample};

/// Metric map keyed by name. Reads take the shared lock, writes the exclusive one.
#[derive(Debug, Default)]
pub struct MemStorage {
    metrics: RwLock<HashMap<String, MetricValue>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole metric set, e.g. after loading a snapshot.
    pub fn restore(&self, metrics: Vec<Metric>) {
        let restored: HashMap<String, MetricValue> =
            metrics.into_iter().map(|m| (m.name, m.value)).collect();
        *self.metrics.write() = restored;
    }

    /// Returns a copy of every stored metric, ordered by name.
    pub fn snapshot(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .metrics
            .read()
            .iter()
            .map(|(name, value)| Metric {
                name: name.clone(),
                value: *value,
            })
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    pub fn get_metric(&self, name: &str) -> Result<Metric, MetricError> {
        self.metrics
            .read()
            .get(name)
            .map(|value| Metric {
                name: name.to_owned(),
                value: *value,
            })
            .ok_or_else(|| MetricError::NotFound(name.to_owned()))
    }

    /// Applies one write under the exclusive lock and returns the stored value.
    pub fn set_metric(&self, metric: Metric) -> Result<Metric, MetricError> {
        let mut map = self.metrics.write();
        let stored = merged(map.get(&metric.name).copied(), &metric)?;
        map.insert(metric.name.clone(), stored);
        Ok(Metric {
            name: metric.name,
            value: stored,
        })
    }

    /// Applies a batch under one exclusive lock. A kind conflict anywhere
    /// in the batch leaves the map untouched.
    pub fn update_metrics(&self, metrics: Vec<Metric>) -> Result<(), MetricError> {
        let mut map = self.metrics.write();
        let mut staged: HashMap<String, MetricValue> = HashMap::with_capacity(metrics.len());
        for metric in &metrics {
            let current = staged
                .get(&metric.name)
                .or_else(|| map.get(&metric.name))
                .copied();
            let value = merged(current, metric)?;
            staged.insert(metric.name.clone(), value);
        }
        map.extend(staged);
        Ok(())
    }

    /// Records one poll: overwrites the allocator gauges, refreshes
    /// `RandomValue` and increments `PollCount` by one.
    ///
    /// A `PollCount` previously stored as a gauge is replaced by a counter
    /// starting at one.
    pub fn update_runtime(&self, sample: &RuntimeSample, random_value: f64) {
        let mut map = self.metrics.write();
        for (name, value) in sample.gauges() {
            map.insert(name.to_owned(), MetricValue::Gauge(value));
        }
        map.insert(RANDOM_VALUE.to_owned(), MetricValue::Gauge(random_value));
        let polls = match map.get(POLL_COUNT) {
            Some(MetricValue::Counter(n)) => n.wrapping_add(1),
            _ => 1,
        };
        map.insert(POLL_COUNT.to_owned(), MetricValue::Counter(polls));
    }
}

fn merged(current: Option<MetricValue>, metric: &Metric) -> Result<MetricValue, MetricError> {
    match current {
        None => Ok(metric.value),
        Some(stored) => stored
            .merge(metric.value)
            .ok_or_else(|| MetricError::InvalidKind {
                name: metric.name.clone(),
                stored: stored.kind(),
                requested: metric.kind(),
            }),
    }
}

#[async_trait]
impl Repository for MemStorage {
    async fn read_all(&self) -> Result<Vec<Metric>, MetricError> {
        Ok(self.snapshot())
    }

    async fn get(&self, name: &str) -> Result<Metric, MetricError> {
        self.get_metric(name)
    }

    async fn set(&self, metric: Metric) -> Result<Metric, MetricError> {
        self.set_metric(metric)
    }

    async fn update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError> {
        self.update_metrics(metrics)
    }
}
