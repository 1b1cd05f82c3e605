//! PostgreSQL repository.
//!
//! Uses the synchronous `postgres` client on the blocking thread pool. All
//! operations go through [`RetryPolicy`]; a dropped connection is
//! re-established on the next attempt.

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use postgres::{Client, GenericClient, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Repository;
use crate::error::MetricError;
use crate::models::{Metric, MetricKind, MetricValue};
use crate::retry::RetryPolicy;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    name TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    value DOUBLE PRECISION NOT NULL
)";

/// Gauges replace, counters add. The `WHERE` clause turns a kind conflict
/// into an empty result instead of an update.
const UPSERT: &str = "INSERT INTO metrics (name, type, value) VALUES ($1, $2, $3)
ON CONFLICT (name) DO UPDATE
SET value = CASE WHEN metrics.type = 'counter'
                 THEN metrics.value + EXCLUDED.value
                 ELSE EXCLUDED.value END
WHERE metrics.type = EXCLUDED.type
RETURNING value";

const SELECT_ALL: &str = "SELECT name, type, value FROM metrics ORDER BY name";
const SELECT_ONE: &str = "SELECT type, value FROM metrics WHERE name = $1";
const SELECT_TYPE: &str = "SELECT type FROM metrics WHERE name = $1";

const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Returns true for errors worth retrying: lost connections, I/O failures,
/// and SQLSTATE classes 08 (connection exception) and 53 (insufficient resources).
pub fn is_transient(e: &postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    if let Some(code) = e.code() {
        let code = code.code();
        return code.starts_with("08") || code.starts_with("53");
    }
    e.source()
        .is_some_and(|s| s.downcast_ref::<std::io::Error>().is_some())
}

impl From<postgres::Error> for MetricError {
    fn from(e: postgres::Error) -> Self {
        let msg = format_postgres_error(&e);
        if is_transient(&e) {
            MetricError::Transient(msg)
        } else {
            MetricError::Backend(msg)
        }
    }
}

fn format_postgres_error(e: &postgres::Error) -> String {
    match e.as_db_error() {
        Some(db_error) => format!("{}: {}", db_error.severity(), db_error.message()),
        None => e.to_string(),
    }
}

struct Connection {
    dsn: String,
    client: Option<Client>,
}

impl Connection {
    /// Ensures the connection is established, reconnecting if it was closed.
    fn ensure_connected(&mut self) -> Result<&mut Client, MetricError> {
        if self.client.as_ref().is_some_and(|c| c.is_closed()) {
            debug!("PostgreSQL connection closed, reconnecting");
            self.client = None;
        }
        if self.client.is_none() {
            let client = Client::connect(&self.dsn, NoTls)?;
            debug!("PostgreSQL connection established");
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| MetricError::Backend("not connected".to_owned()))
    }
}

/// Repository backed by a single `metrics(name, type, value)` table.
pub struct PgStorage {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl PgStorage {
    /// Connects and creates the metrics table if it does not exist.
    ///
    /// `cancel` aborts pending retry waits for every later operation.
    pub async fn connect(
        dsn: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self, MetricError> {
        Self::connect_with_retry(dsn, cancel, RetryPolicy::default()).await
    }

    pub async fn connect_with_retry(
        dsn: impl Into<String>,
        cancel: CancellationToken,
        retry: RetryPolicy,
    ) -> Result<Self, MetricError> {
        let storage = Self {
            conn: Arc::new(Mutex::new(Connection {
                dsn: dsn.into(),
                client: None,
            })),
            retry,
            cancel,
        };
        storage
            .execute(|client| {
                client.batch_execute(CREATE_TABLE)?;
                Ok(())
            })
            .await?;
        info!("metrics table ready");
        Ok(storage)
    }

    /// Runs `op` on the blocking pool with a live client, under the retry policy.
    async fn execute<T, F>(&self, op: F) -> Result<T, MetricError>
    where
        F: Fn(&mut Client) -> Result<T, MetricError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        self.retry
            .run(&self.cancel, || {
                let conn = self.conn.clone();
                let op = op.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut conn = conn.lock();
                        let client = conn.ensure_connected()?;
                        let result = (*op)(client);
                        if client.is_closed() {
                            conn.client = None;
                        }
                        result
                    })
                    .await
                    .map_err(|e| MetricError::Backend(format!("database task failed: {e}")))?
                }
            })
            .await
    }
}

fn decode(name: String, kind: &str, value: f64) -> Result<Metric, MetricError> {
    let kind: MetricKind = kind
        .parse()
        .map_err(|_| MetricError::Backend(format!("metric {name} has unknown type {kind}")))?;
    let value = match kind {
        MetricKind::Gauge => MetricValue::Gauge(value),
        MetricKind::Counter => MetricValue::Counter(value.round() as i64),
    };
    Ok(Metric { name, value })
}

fn upsert(client: &mut impl GenericClient, metric: &Metric) -> Result<Metric, MetricError> {
    let requested = metric.kind();
    let row = client.query_opt(
        UPSERT,
        &[&metric.name, &requested.as_str(), &metric.value.as_f64()],
    )?;
    if let Some(row) = row {
        return decode(metric.name.clone(), requested.as_str(), row.get(0));
    }

    let stored: String = client
        .query_opt(SELECT_TYPE, &[&metric.name])?
        .map(|row| row.get(0))
        .ok_or_else(|| MetricError::Backend(format!("upsert of {} had no effect", metric.name)))?;
    Err(MetricError::InvalidKind {
        name: metric.name.clone(),
        stored: stored
            .parse()
            .map_err(|_| MetricError::Backend(format!("unknown stored type {stored}")))?,
        requested,
    })
}

#[async_trait]
impl Repository for PgStorage {
    async fn read_all(&self) -> Result<Vec<Metric>, MetricError> {
        self.execute(|client| {
            client
                .query(SELECT_ALL, &[])?
                .into_iter()
                .map(|row| {
                    let kind: String = row.get(1);
                    decode(row.get(0), &kind, row.get(2))
                })
                .collect()
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<Metric, MetricError> {
        let name = name.to_owned();
        self.execute(move |client| {
            let row = client
                .query_opt(SELECT_ONE, &[&name])?
                .ok_or_else(|| MetricError::NotFound(name.clone()))?;
            let kind: String = row.get(0);
            decode(name.clone(), &kind, row.get(1))
        })
        .await
    }

    async fn set(&self, metric: Metric) -> Result<Metric, MetricError> {
        self.execute(move |client| upsert(client, &metric)).await
    }

    async fn update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError> {
        self.execute(move |client| {
            let mut tx = client.transaction()?;
            for metric in &metrics {
                upsert(&mut tx, metric)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), MetricError> {
        self.execute(|client| Ok(client.is_valid(PING_TIMEOUT)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_coerces_counter_to_integer() {
        let m = decode("hits".into(), "counter", 4.0).unwrap();
        assert_eq!(m.value, MetricValue::Counter(4));

        let m = decode("temp".into(), "gauge", 3.5).unwrap();
        assert_eq!(m.value, MetricValue::Gauge(3.5));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(matches!(
            decode("x".into(), "histogram", 1.0),
            Err(MetricError::Backend(_))
        ));
    }

    /// Runs against a live database when `METRICA_TEST_DSN` is set.
    #[tokio::test]
    async fn round_trip_against_live_database() {
        let Ok(dsn) = std::env::var("METRICA_TEST_DSN") else {
            return;
        };
        let repo = PgStorage::connect(dsn, CancellationToken::new())
            .await
            .unwrap();
        let suffix = std::process::id();
        let counter = format!("test_hits_{suffix}");
        let gauge = format!("test_temp_{suffix}");

        repo.set(Metric::counter(&counter, 2)).await.unwrap();
        let stored = repo.set(Metric::counter(&counter, 2)).await.unwrap();
        assert_eq!(stored.value, MetricValue::Counter(4));

        repo.update_batch(vec![Metric::gauge(&gauge, 1.5), Metric::gauge(&gauge, 2.5)])
            .await
            .unwrap();
        assert_eq!(
            repo.get(&gauge).await.unwrap().value,
            MetricValue::Gauge(2.5)
        );

        let err = repo.set(Metric::gauge(&counter, 1.0)).await.unwrap_err();
        assert!(matches!(err, MetricError::InvalidKind { .. }));

        assert!(matches!(
            repo.get("test_missing_metric").await,
            Err(MetricError::NotFound(_))
        ));
        repo.ping().await.unwrap();
    }
}
