//! metrica-core - shared library for the metrica agent and collector.
//!
//! Provides:
//! - `models` - metric values, wire envelopes, runtime allocator sample
//! - `error` - error taxonomy shared by every transport
//! - `repository` - metric repository trait with in-memory and PostgreSQL backends
//! - `snapshot` - JSON file snapshot of the in-memory repository
//! - `retry` - retry policy for transient backend failures
//! - `crypto` - HMAC body signing, RSA body envelope, trusted subnet check
//! - `compress` - gzip helpers for request and response bodies
//! - `pool` - one-shot rate-limited worker pool
//! - `grpc` - gRPC wire messages and generated client/server stubs

pub mod compress;
pub mod crypto;
pub mod error;
pub mod grpc;
pub mod models;
pub mod pool;
pub mod repository;
pub mod retry;
pub mod snapshot;

pub use error::MetricError;
pub use models::{Envelope, Metric, MetricKind, MetricValue};

/// Crate version, shared by both binaries for `--version` and startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
