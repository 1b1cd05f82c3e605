//! Metric data model: kinds, tagged values, stored metrics and the JSON wire envelope.

mod runtime;

pub use runtime::{RuntimeSample, POLL_COUNT, RANDOM_VALUE};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MetricError;

/// Metric kind. Determines how a value is stored and how writes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(MetricError::validation("invalid metric type")),
        }
    }
}

/// A metric value. Gauges replace on write, counters add.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parses a textual value as the given kind.
    ///
    /// Gauges accept any float literal. Counters accept signed base-10
    /// integers and `0x`/`0o`/`0b` prefixed literals.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        match kind {
            MetricKind::Gauge => raw
                .parse::<f64>()
                .map(MetricValue::Gauge)
                .map_err(|_| MetricError::parse("invalid metric value")),
            MetricKind::Counter => parse_counter(raw).map(MetricValue::Counter),
        }
    }

    /// Combines a write into the stored value: gauges replace, counters add.
    ///
    /// Returns `None` when the kinds differ.
    pub fn merge(self, incoming: MetricValue) -> Option<MetricValue> {
        match (self, incoming) {
            (MetricValue::Gauge(_), MetricValue::Gauge(v)) => Some(MetricValue::Gauge(v)),
            (MetricValue::Counter(stored), MetricValue::Counter(delta)) => {
                Some(MetricValue::Counter(stored.wrapping_add(delta)))
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Gauge(v) => v,
            MetricValue::Counter(v) => v as f64,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{}", v),
            MetricValue::Counter(v) => write!(f, "{}", v),
        }
    }
}

/// A named metric as stored by a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// JSON wire form of one metric.
///
/// On writes exactly one of `delta`/`value` is set, matching `kind`.
/// On reads the populated field mirrors the stored kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_delta"
    )]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Envelope {
    /// Builds a read request (`id` + `type`, no value).
    pub fn query(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind,
            delta: None,
            value: None,
        }
    }

    /// Validates the envelope and converts it into a metric write.
    pub fn into_metric(self) -> Result<Metric, MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::validation("metric id is empty"));
        }
        let value = match (self.kind, self.delta, self.value) {
            (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
            (MetricKind::Gauge, None, Some(value)) => MetricValue::Gauge(value),
            (MetricKind::Counter, None, _) => {
                return Err(MetricError::validation("counter metric requires delta"));
            }
            (MetricKind::Gauge, _, None) => {
                return Err(MetricError::validation("gauge metric requires value"));
            }
            _ => {
                return Err(MetricError::validation(
                    "exactly one of delta or value must be set",
                ));
            }
        };
        Ok(Metric {
            name: self.id,
            value,
        })
    }
}

impl From<&Metric> for Envelope {
    fn from(m: &Metric) -> Self {
        let (delta, value) = match m.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: m.name.clone(),
            kind: m.kind(),
            delta,
            value,
        }
    }
}

/// Parses a counter literal: optional sign, then decimal or a `0x`/`0o`/`0b` prefixed number.
pub fn parse_counter(raw: &str) -> Result<i64, MetricError> {
    let invalid = || MetricError::parse("invalid metric value");

    let (negative, rest) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };

    let lower = rest.get(..2).map(|p| p.to_ascii_lowercase());
    let (radix, digits) = match lower.as_deref() {
        Some("0x") => (16, &rest[2..]),
        Some("0o") => (8, &rest[2..]),
        Some("0b") => (2, &rest[2..]),
        _ => (10, rest),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    let magnitude = i128::from_str_radix(digits, radix).map_err(|_| invalid())?;
    let signed = if negative { -magnitude } else { magnitude };
    i64::try_from(signed).map_err(|_| invalid())
}

/// Converts a JSON number into a counter value.
///
/// Integral floats (`3.0`) are accepted; fractional ones are rejected.
pub fn number_to_counter(n: &serde_json::Number) -> Result<i64, MetricError> {
    if let Some(v) = n.as_i64() {
        return Ok(v);
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Ok(f as i64)
        }
        _ => Err(MetricError::parse(format!(
            "counter value {} is not an integer",
            n
        ))),
    }
}

fn deserialize_delta<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number: Option<serde_json::Number> = Option::deserialize(deserializer)?;
    number
        .map(|n| number_to_counter(&n).map_err(serde::de::Error::custom))
        .transpose()
}
