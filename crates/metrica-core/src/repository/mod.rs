//! Metric repository abstraction.
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────────┐
//! │ HTTP / gRPC  │────▶│   dyn Repository          │
//! │   handlers   │     │  read_all / get / set     │
//! └──────────────┘     │  update_batch / ping      │
//!                      └─────────────┬─────────────┘
//!                        ┌───────────┴───────────┐
//!                 ┌──────▼──────┐         ┌──────▼──────┐
//!                 │ MemStorage  │         │  PgStorage  │
//!                 │ RwLock map  │         │ upsert+retry│
//!                 └──────┬──────┘         └─────────────┘
//!                        │
//!                 ┌──────▼──────┐
//!                 │FileSnapshot │
//!                 └─────────────┘
//! ```
//!
//! Both backends enforce the same write rule: gauges replace, counters add,
//! and a name keeps the kind it was first written with.

mod memory;
mod pg;

pub use memory::MemStorage;
pub use pg::{PgStorage, is_transient};

use async_trait::async_trait;

use crate::error::MetricError;
use crate::models::Metric;

/// Storage for the live metric set. Callers always receive copies.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Returns every stored metric, ordered by name.
    async fn read_all(&self) -> Result<Vec<Metric>, MetricError>;

    /// Returns the metric stored under `name`, or `NotFound`.
    async fn get(&self, name: &str) -> Result<Metric, MetricError>;

    /// Writes one metric and returns the stored result (the running total for counters).
    async fn set(&self, metric: Metric) -> Result<Metric, MetricError>;

    /// Writes a batch atomically: either every metric is applied or none is.
    async fn update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError>;

    /// Checks backend reachability.
    async fn ping(&self) -> Result<(), MetricError> {
        Err(MetricError::NotImplemented)
    }
}
