//! HTTP middleware: access log, trusted subnet, HMAC, RSA, gzip, panic recovery.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrica_core::compress;
use metrica_core::crypto::{
    BodySigner, Decryptor, HASH_HEADER, REAL_IP_HEADER, SubnetError, TrustedSubnet,
};
use tracing::{debug, error, info, warn};

/// Upper bound for request bodies read by the middleware and handlers.
pub(crate) const BODY_LIMIT: usize = 16 * 1024 * 1024;

pub(crate) const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Media types for which the gzip codec is active.
const GZIP_MEDIA_TYPES: [&str; 3] = ["application/json", "text/html", "html/text"];

/// Plain-text response with an explicit content type.
pub(crate) fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN))],
        body.into(),
    )
        .into_response()
}

/// Buffers a body, mapping read failures to a 400 response.
pub(crate) async fn read_body(body: Body) -> Result<Bytes, Response> {
    axum::body::to_bytes(body, BODY_LIMIT).await.map_err(|e| {
        debug!(error = %e, "failed to read request body");
        text(StatusCode::BAD_REQUEST, "failed to read body")
    })
}

async fn buffer_response(response: Response) -> Result<(axum::http::response::Parts, Bytes), Response> {
    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => Ok((parts, bytes)),
        Err(e) => {
            error!(error = %e, "failed to buffer response body");
            Err(text(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"))
        }
    }
}

// ============================================================
// Access log
// ============================================================

/// Logs one line per request: client, status, latency and response size.
#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let client = req
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let t0 = Instant::now();

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let latency_ms = t0.elapsed().as_millis() as u64;
            let status = response.status().as_u16();
            let size = response.body().size_hint().exact().unwrap_or(0);
            info!(client, status, latency_ms, size, "{method} {path}");
            Ok(response)
        })
    }
}

// ============================================================
// Trusted subnet
// ============================================================

pub(crate) async fn check_subnet(
    State(subnet): State<Arc<TrustedSubnet>>,
    req: Request,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(REAL_IP_HEADER)
        .map(|v| v.to_str().unwrap_or_default());
    match subnet.check(header) {
        Ok(_) => next.run(req).await,
        Err(e @ SubnetError::Malformed) => {
            warn!(header = ?header, "rejected request without a valid X-Real-IP");
            text(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e @ SubnetError::Denied(_)) => {
            warn!(error = %e, "rejected request from untrusted address");
            text(StatusCode::FORBIDDEN, e.to_string())
        }
    }
}

// ============================================================
// HMAC signatures
// ============================================================

/// Verifies the request signature when one is sent and signs every response.
pub(crate) async fn verify_and_sign(
    State(signer): State<BodySigner>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return sign_response(&signer, response).await,
    };

    if let Some(signature) = parts.headers.get(HASH_HEADER)
        && !signature.is_empty()
    {
        let valid = signature
            .to_str()
            .ok()
            .and_then(|s| signer.verify(&bytes, s).ok())
            .unwrap_or(false);
        if !valid {
            warn!(path = %parts.uri.path(), "request signature mismatch");
            return sign_response(&signer, text(StatusCode::BAD_REQUEST, "invalid hash")).await;
        }
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    sign_response(&signer, response).await
}

async fn sign_response(signer: &BodySigner, response: Response) -> Response {
    let (mut parts, bytes) = match buffer_response(response).await {
        Ok(buffered) => buffered,
        Err(response) => return response,
    };
    match signer
        .sign(&bytes)
        .map(|sig| HeaderValue::from_str(&sig))
    {
        Ok(Ok(value)) => {
            parts.headers.insert(HASH_HEADER, value);
        }
        Ok(Err(e)) => error!(error = %e, "invalid signature header value"),
        Err(e) => error!(error = %e, "failed to sign response"),
    }
    Response::from_parts(parts, Body::from(bytes))
}

// ============================================================
// RSA bodies
// ============================================================

/// Decrypts non-empty request bodies with the collector's private key.
pub(crate) async fn decrypt_body(
    State(decryptor): State<Decryptor>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    if bytes.is_empty() {
        return next.run(Request::from_parts(parts, Body::empty())).await;
    }

    match decryptor.decrypt(&bytes) {
        Ok(plain) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            next.run(Request::from_parts(parts, Body::from(plain))).await
        }
        Err(e) => {
            warn!(error = %e, path = %parts.uri.path(), "failed to decrypt request body");
            text(StatusCode::BAD_REQUEST, "failed to decrypt body")
        }
    }
}

// ============================================================
// Gzip
// ============================================================

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// True if the `Accept` header names a media type the codec handles.
fn codec_enabled(headers: &HeaderMap) -> bool {
    header_str(headers, header::ACCEPT)
        .split(',')
        .filter_map(|part| part.split(';').next())
        .map(str::trim)
        .any(|media| {
            GZIP_MEDIA_TYPES
                .iter()
                .any(|t| media.eq_ignore_ascii_case(t))
        })
}

/// Gunzips `Content-Encoding: gzip` requests and gzips successful responses
/// for clients sending `Accept-Encoding: gzip`.
pub(crate) async fn gzip_codec(req: Request, next: Next) -> Response {
    if !codec_enabled(req.headers()) {
        return next.run(req).await;
    }
    let wants_gzip = compress::accepts_gzip(header_str(req.headers(), header::ACCEPT_ENCODING));

    let req = if compress::accepts_gzip(header_str(req.headers(), header::CONTENT_ENCODING)) {
        let (mut parts, body) = req.into_parts();
        let bytes = match read_body(body).await {
            Ok(bytes) => bytes,
            Err(response) => return response,
        };
        match compress::gunzip(&bytes, BODY_LIMIT) {
            Ok(plain) => {
                parts.headers.remove(header::CONTENT_ENCODING);
                parts.headers.remove(header::CONTENT_LENGTH);
                Request::from_parts(parts, Body::from(plain))
            }
            Err(e) => {
                warn!(error = %e, "invalid gzip request body");
                return text(StatusCode::BAD_REQUEST, "invalid gzip body");
            }
        }
    } else {
        req
    };

    let response = next.run(req).await;
    if !wants_gzip || response.status().as_u16() >= 300 {
        return response;
    }

    let (mut parts, bytes) = match buffer_response(response).await {
        Ok(buffered) => buffered,
        Err(response) => return response,
    };
    match compress::gzip(&bytes) {
        Ok(packed) => {
            parts.headers.insert(
                header::CONTENT_ENCODING,
                HeaderValue::from_static(compress::GZIP),
            );
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(packed))
        }
        Err(e) => {
            error!(error = %e, "failed to compress response");
            Response::from_parts(parts, Body::from(bytes))
        }
    }
}

// ============================================================
// Panic recovery
// ============================================================

/// Response for a panicking handler. The panic message is logged, never sent.
pub(crate) fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic = detail, "handler panicked");
    text(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}
