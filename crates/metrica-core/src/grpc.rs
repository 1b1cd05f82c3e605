//! gRPC wire messages for the `metrica.v1.Metrics` service.
//!
//! Messages are declared here with prost derives; `build.rs` generates the
//! `metrics_client` and `metrics_server` modules against them.
//!
//! ```text
//! message Metric {
//!   string id = 1;
//!   MetricType type = 2;
//!   optional int64 delta = 3;
//!   optional double value = 4;
//! }
//! service Metrics {
//!   rpc UpdateMetric(UpdateMetricRequest) returns (UpdateMetricResponse);
//!   rpc GetMetric(GetMetricRequest) returns (GetMetricResponse);
//! }
//! ```

use crate::error::MetricError;
use crate::models::{self, Envelope, MetricKind};

tonic::include_proto!("metrica.v1.Metrics");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    Unspecified = 0,
    Gauge = 1,
    Counter = 2,
}

impl From<MetricKind> for MetricType {
    fn from(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Gauge => MetricType::Gauge,
            MetricKind::Counter => MetricType::Counter,
        }
    }
}

/// Decodes the raw enum field; unknown and unspecified values are rejected.
pub fn decode_kind(raw: i32) -> Result<MetricKind, MetricError> {
    match MetricType::try_from(raw) {
        Ok(MetricType::Gauge) => Ok(MetricKind::Gauge),
        Ok(MetricType::Counter) => Ok(MetricKind::Counter),
        _ => Err(MetricError::validation("invalid metric type")),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metric {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "MetricType", tag = "2")]
    pub kind: i32,
    #[prost(int64, optional, tag = "3")]
    pub delta: Option<i64>,
    #[prost(double, optional, tag = "4")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateMetricRequest {
    #[prost(message, optional, tag = "1")]
    pub metric: Option<Metric>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateMetricResponse {
    #[prost(message, optional, tag = "1")]
    pub metric: Option<Metric>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetricRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "MetricType", tag = "2")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetricResponse {
    #[prost(message, optional, tag = "1")]
    pub metric: Option<Metric>,
}

impl From<&models::Metric> for Metric {
    fn from(m: &models::Metric) -> Self {
        let envelope = Envelope::from(m);
        Self {
            id: envelope.id,
            kind: MetricType::from(envelope.kind) as i32,
            delta: envelope.delta,
            value: envelope.value,
        }
    }
}

impl TryFrom<Metric> for models::Metric {
    type Error = MetricError;

    /// Applies the same rules as the JSON envelope.
    fn try_from(m: Metric) -> Result<Self, Self::Error> {
        Envelope {
            kind: decode_kind(m.kind)?,
            id: m.id,
            delta: m.delta,
            value: m.value,
        }
        .into_metric()
    }
}

impl UpdateMetricRequest {
    /// Extracts the metric write, rejecting a missing message.
    pub fn into_metric(self) -> Result<models::Metric, MetricError> {
        self.metric
            .ok_or_else(|| MetricError::validation("metric is required"))?
            .try_into()
    }
}

impl GetMetricRequest {
    pub fn new(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind: MetricType::from(kind) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn counter_round_trip_through_wire() {
        let original = models::Metric::counter("hits", 0);
        let wire = UpdateMetricRequest {
            metric: Some(Metric::from(&original)),
        }
        .encode_to_vec();

        let decoded = UpdateMetricRequest::decode(wire.as_slice()).unwrap();
        // A zero delta keeps its presence thanks to the optional field.
        assert_eq!(decoded.metric.as_ref().unwrap().delta, Some(0));
        assert_eq!(decoded.into_metric().unwrap(), original);
    }

    #[test]
    fn gauge_conversion() {
        let wire = Metric::from(&models::Metric::gauge("temp", 3.5));
        assert_eq!(wire.kind, MetricType::Gauge as i32);
        assert_eq!(wire.value, Some(3.5));
        assert_eq!(wire.delta, None);
    }

    #[test]
    fn missing_metric_is_invalid() {
        let err = UpdateMetricRequest { metric: None }
            .into_metric()
            .unwrap_err();
        assert!(matches!(err, MetricError::Validation(_)));
    }

    #[test]
    fn unspecified_or_unknown_type_is_invalid() {
        let mut m = Metric::from(&models::Metric::gauge("temp", 1.0));
        m.kind = MetricType::Unspecified as i32;
        assert!(models::Metric::try_from(m.clone()).is_err());
        m.kind = 42;
        let err = models::Metric::try_from(m).unwrap_err();
        assert_eq!(err.to_string(), "invalid metric type");
    }

    #[test]
    fn empty_id_and_missing_value_are_invalid() {
        let mut m = Metric::from(&models::Metric::counter("hits", 1));
        m.id.clear();
        assert!(models::Metric::try_from(m).is_err());

        let m = Metric {
            id: "temp".into(),
            kind: MetricType::Gauge as i32,
            delta: None,
            value: None,
        };
        assert!(models::Metric::try_from(m).is_err());
    }

    #[test]
    fn get_request_carries_kind() {
        let req = GetMetricRequest::new("hits", MetricKind::Counter);
        assert_eq!(decode_kind(req.kind).unwrap(), MetricKind::Counter);
    }
}
