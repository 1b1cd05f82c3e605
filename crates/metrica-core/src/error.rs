//! Error taxonomy shared by the repositories and both transports.

use crate::models::MetricKind;

/// Error type for metric parsing, validation and storage failures.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    /// Malformed input: bad JSON, bad number, bad CIDR.
    #[error("{0}")]
    Parse(String),
    /// Well-formed input that breaks a metric rule (empty id, missing value, unknown kind).
    #[error("{0}")]
    Validation(String),
    /// No metric stored under the name.
    #[error("metric {0} not found")]
    NotFound(String),
    /// The name is already stored with a different kind.
    #[error("metric {name} is a {stored}, not a {requested}")]
    InvalidKind {
        name: String,
        stored: MetricKind,
        requested: MetricKind,
    },
    /// Backend reported a condition worth retrying (connection loss, resource exhaustion).
    #[error("transient backend error: {0}")]
    Transient(String),
    /// Backend reported a permanent failure.
    #[error("backend error: {0}")]
    Backend(String),
    /// Every retry attempt failed; carries the last error.
    #[error("all retries failed: {0}")]
    RetriesExhausted(Box<MetricError>),
    /// The repository has no health check.
    #[error("ping is not supported by this repository")]
    NotImplemented,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetricError {
    pub fn parse(msg: impl Into<String>) -> Self {
        MetricError::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MetricError::Validation(msg.into())
    }

    /// Returns true if the failed operation may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, MetricError::Transient(_))
    }

    /// Returns true for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MetricError::Parse(_) | MetricError::Validation(_) | MetricError::Json(_)
        )
    }
}

impl From<MetricError> for tonic::Status {
    fn from(e: MetricError) -> Self {
        let msg = e.to_string();
        match e {
            MetricError::Parse(_)
            | MetricError::Validation(_)
            | MetricError::Json(_)
            | MetricError::InvalidKind { .. } => tonic::Status::invalid_argument(msg),
            MetricError::NotFound(_) => tonic::Status::not_found(msg),
            MetricError::NotImplemented => tonic::Status::unimplemented(msg),
            MetricError::Transient(_)
            | MetricError::Backend(_)
            | MetricError::RetriesExhausted(_)
            | MetricError::Io(_) => tonic::Status::internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(MetricError::Transient("conn reset".into()).is_transient());
        assert!(!MetricError::Backend("syntax".into()).is_transient());
        assert!(
            !MetricError::RetriesExhausted(Box::new(MetricError::Transient("x".into())))
                .is_transient()
        );
    }

    #[test]
    fn exhausted_message_wraps_last_error() {
        let e = MetricError::RetriesExhausted(Box::new(MetricError::Transient("gone".into())));
        assert_eq!(
            e.to_string(),
            "all retries failed: transient backend error: gone"
        );
    }

    #[test]
    fn grpc_status_codes() {
        let status: tonic::Status = MetricError::NotFound("x".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = MetricError::validation("empty id").into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = MetricError::Backend("down".into()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
