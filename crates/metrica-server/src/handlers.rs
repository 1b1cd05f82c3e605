//! HTTP handlers for the update, value, index and ping routes.

use std::fmt::Write as _;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use metrica_core::MetricError;
use metrica_core::models::{Envelope, Metric, MetricKind, MetricValue};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::middleware::text;
use crate::state::AppState;

/// Default HTTP status for a repository or input error.
pub(crate) fn status_for(e: &MetricError) -> StatusCode {
    match e {
        MetricError::Parse(_)
        | MetricError::Validation(_)
        | MetricError::Json(_)
        | MetricError::InvalidKind { .. } => StatusCode::BAD_REQUEST,
        MetricError::NotFound(_) => StatusCode::NOT_FOUND,
        MetricError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        MetricError::Transient(_)
        | MetricError::Backend(_)
        | MetricError::RetriesExhausted(_)
        | MetricError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &MetricError) -> Response {
    error_with_status(status_for(e), e)
}

fn error_with_status(status: StatusCode, e: &MetricError) -> Response {
    if status.is_server_error() {
        error!(error = %e, "request failed");
        // Backend details stay in the log.
        return text(status, status.canonical_reason().unwrap_or("internal error"));
    }
    debug!(error = %e, status = status.as_u16(), "request rejected");
    text(status, e.to_string())
}

fn parse_kind(raw: &str) -> Result<MetricKind, Response> {
    raw.parse::<MetricKind>()
        .map_err(|e| text(StatusCode::BAD_REQUEST, e.to_string()))
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| error_response(&MetricError::parse(e.to_string())))
}

/// `POST /update/{type}/{name}/{value}`
pub(crate) async fn update_path(
    State(state): State<AppState>,
    Path((kind, name, raw)): Path<(String, String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let value = match MetricValue::parse(kind, &raw) {
        Ok(value) => value,
        Err(e) => return error_response(&e),
    };

    match state.repo.set(Metric { name, value }).await {
        Ok(_) => {
            state.written().await;
            text(StatusCode::OK, "")
        }
        Err(e @ MetricError::InvalidKind { .. }) => error_with_status(StatusCode::NOT_FOUND, &e),
        Err(e) => error_response(&e),
    }
}

/// `POST /update/` with one JSON envelope. Echoes the stored metric.
pub(crate) async fn update_json(State(state): State<AppState>, body: Bytes) -> Response {
    let metric = match parse_json::<Envelope>(&body).and_then(|env| {
        env.into_metric().map_err(|e| error_response(&e))
    }) {
        Ok(metric) => metric,
        Err(response) => return response,
    };

    match state.repo.set(metric).await {
        Ok(stored) => {
            state.written().await;
            Json(Envelope::from(&stored)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// `POST /updates/` with a JSON array. Applied atomically; echoes the first entry.
pub(crate) async fn update_batch(State(state): State<AppState>, body: Bytes) -> Response {
    let envelopes = match parse_json::<Vec<Envelope>>(&body) {
        Ok(envelopes) => envelopes,
        Err(response) => return response,
    };
    let Some(first) = envelopes.first().cloned() else {
        return text(StatusCode::BAD_REQUEST, "empty batch");
    };
    let metrics = match envelopes
        .into_iter()
        .map(Envelope::into_metric)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(metrics) => metrics,
        Err(e) => return error_response(&e),
    };

    let count = metrics.len();
    match state.repo.update_batch(metrics).await {
        Ok(()) => {
            debug!(count, "batch applied");
            state.written().await;
            Json(first).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// `GET /value/{type}/{name}` returns the bare value as text.
pub(crate) async fn value_path(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    match state.repo.get(&name).await {
        Ok(metric) if metric.kind() == kind => text(StatusCode::OK, metric.value.to_string()),
        Ok(metric) => {
            let e = MetricError::InvalidKind {
                stored: metric.kind(),
                name: metric.name,
                requested: kind,
            };
            error!(error = %e, "value requested with the wrong type");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => error_response(&e),
    }
}

/// `POST /value/` with `{id, type}` returns the populated envelope.
pub(crate) async fn value_json(State(state): State<AppState>, body: Bytes) -> Response {
    let query = match parse_json::<Envelope>(&body) {
        Ok(query) => query,
        Err(response) => return response,
    };
    if query.id.is_empty() {
        return error_response(&MetricError::validation("metric id is empty"));
    }

    match state.repo.get(&query.id).await {
        Ok(metric) if metric.kind() == query.kind => Json(Envelope::from(&metric)).into_response(),
        Ok(_) => error_response(&MetricError::NotFound(query.id)),
        Err(e) => error_response(&e),
    }
}

/// `GET /` lists every metric as `name - value` lines.
pub(crate) async fn index(State(state): State<AppState>) -> Response {
    let metrics = match state.repo.read_all().await {
        Ok(metrics) => metrics,
        Err(e) => return error_response(&e),
    };
    let mut page = String::new();
    for metric in &metrics {
        let _ = writeln!(page, "{} - {}", metric.name, metric.value);
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )],
        page,
    )
        .into_response()
}

/// `GET /ping` checks backend reachability.
pub(crate) async fn ping(State(state): State<AppState>) -> Response {
    match state.repo.ping().await {
        Ok(()) => text(StatusCode::OK, ""),
        Err(e) => error_response(&e),
    }
}
