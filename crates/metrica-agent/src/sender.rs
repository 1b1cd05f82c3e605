//! Outbound transports.
//!
//! HTTP bodies go through the same pipeline in every JSON mode:
//! encode → gzip → RSA encrypt (optional) → HMAC sign the final bytes
//! (optional). Query mode sends empty bodies with the value in the path.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use metrica_core::compress::{GZIP, gzip};
use metrica_core::crypto::{BodySigner, CryptoError, Encryptor, HASH_HEADER, REAL_IP_HEADER};
use metrica_core::grpc::metrics_client::MetricsClient;
use metrica_core::grpc::{self, UpdateMetricRequest};
use metrica_core::{Envelope, Metric};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};

use crate::config::{AgentConfig, ReportMode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes escaped in a metric name used as one path segment.
const PATH_SEGMENT_PCT_ENCODING_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to compress body: {0}")]
    Compress(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collector responded {status}: {body}")]
    Status { status: u16, body: String },
    #[error("gRPC transport: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gRPC call failed: {0}")]
    Grpc(#[from] tonic::Status),
    #[error("cancelled")]
    Cancelled,
}

/// One prepared HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub path: String,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    /// JSON modes set `Accept`, `Content-Encoding` and carry a (possibly encrypted) gzip body.
    pub json: bool,
}

struct HttpInner {
    client: reqwest::Client,
    base_url: String,
    mode: ReportMode,
    signer: Option<BodySigner>,
    encryptor: Option<Encryptor>,
}

#[derive(Clone)]
pub struct HttpSender {
    inner: Arc<HttpInner>,
}

impl HttpSender {
    pub fn new(
        address: &str,
        mode: ReportMode,
        signer: Option<BodySigner>,
        encryptor: Option<Encryptor>,
    ) -> Result<Self, SendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                base_url: base_url(address),
                mode,
                signer,
                encryptor,
            }),
        })
    }

    /// Encodes a repository snapshot into the requests of one report cycle.
    pub fn payloads(&self, metrics: &[Metric]) -> Result<Vec<Payload>, SendError> {
        match self.inner.mode {
            ReportMode::Query => Ok(metrics
                .iter()
                .map(|m| Payload {
                    path: format!(
                        "/update/{}/{}/{}",
                        m.kind(),
                        utf8_percent_encode(&m.name, PATH_SEGMENT_PCT_ENCODING_SET),
                        m.value
                    ),
                    body: Vec::new(),
                    content_type: "text/plain",
                    json: false,
                })
                .collect()),
            ReportMode::Json => metrics
                .iter()
                .map(|m| self.json_payload("/update/", serde_json::to_vec(&Envelope::from(m))?))
                .collect(),
            ReportMode::Batch => {
                if metrics.is_empty() {
                    return Ok(Vec::new());
                }
                let batch: Vec<Envelope> = metrics.iter().map(Envelope::from).collect();
                Ok(vec![self.json_payload("/updates/", serde_json::to_vec(&batch)?)?])
            }
        }
    }

    fn json_payload(&self, path: &str, json: Vec<u8>) -> Result<Payload, SendError> {
        let mut body = gzip(&json)?;
        if let Some(encryptor) = &self.inner.encryptor {
            body = encryptor.encrypt(&body)?;
        }
        Ok(Payload {
            path: path.to_owned(),
            body,
            content_type: "application/json",
            json: true,
        })
    }

    pub async fn send(
        &self,
        payload: Payload,
        ip: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let mut request = self
            .inner
            .client
            .post(format!("{}{}", self.inner.base_url, payload.path))
            .header(CONTENT_TYPE, payload.content_type)
            .header(REAL_IP_HEADER, ip.to_string());
        if payload.json {
            request = request
                .header(ACCEPT, "application/json")
                .header(CONTENT_ENCODING, GZIP);
        }
        if let Some(signer) = &self.inner.signer {
            request = request.header(HASH_HEADER, signer.sign(&payload.body)?);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            r = request.body(payload.body).send() => r?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status {
                status: status.as_u16(),
                body: body.trim().to_owned(),
            });
        }
        Ok(())
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_owned()
    } else {
        format!("http://{address}")
    }
}

#[derive(Clone)]
pub struct GrpcSender {
    client: MetricsClient<Channel>,
}

impl GrpcSender {
    /// Creates a lazily connected client; the first call opens the channel.
    pub fn new(address: &str) -> Result<Self, SendError> {
        let endpoint = Endpoint::from_shared(base_url(address))?.timeout(REQUEST_TIMEOUT);
        Ok(Self {
            client: MetricsClient::new(endpoint.connect_lazy()),
        })
    }

    pub async fn send(
        &self,
        metric: &Metric,
        ip: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let mut request = tonic::Request::new(UpdateMetricRequest {
            metric: Some(grpc::Metric::from(metric)),
        });
        if let Ok(value) = MetadataValue::try_from(ip.to_string()) {
            request.metadata_mut().insert(REAL_IP_HEADER, value);
        }

        let mut client = self.client.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::Cancelled),
            r = client.update_metric(request) => r.map(|_| ()).map_err(SendError::from),
        }
    }
}

/// The transport selected at startup.
#[derive(Clone)]
pub enum Transport {
    Http(HttpSender),
    Grpc(GrpcSender),
}

impl Transport {
    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Self> {
        if let Some(addr) = &config.grpc_address {
            return Ok(Transport::Grpc(GrpcSender::new(addr)?));
        }
        let signer = config
            .key
            .as_deref()
            .map(|k| BodySigner::new(k.as_bytes()))
            .transpose()?;
        let encryptor = config
            .crypto_key
            .as_deref()
            .map(Encryptor::from_file)
            .transpose()?;
        Ok(Transport::Http(HttpSender::new(
            &config.address,
            config.mode,
            signer,
            encryptor,
        )?))
    }
}
