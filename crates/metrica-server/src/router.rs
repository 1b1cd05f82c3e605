//! Route table and middleware stack.
//!
//! Request flow, outermost first:
//!
//! ```text
//! access log → trusted subnet → HMAC verify/sign → RSA decrypt → gzip → catch panic → handler
//! ```

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use metrica_core::crypto::{BodySigner, Decryptor, TrustedSubnet};
use tower_http::catch_panic::CatchPanicLayer;

use crate::handlers;
use crate::middleware::{self, AccessLogLayer};
use crate::state::AppState;

/// Optional request protections, each enabled by its own setting.
#[derive(Clone, Default)]
pub(crate) struct Protections {
    pub(crate) subnet: Option<TrustedSubnet>,
    pub(crate) signer: Option<BodySigner>,
    pub(crate) decryptor: Option<Decryptor>,
}

pub(crate) fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/ping", get(handlers::ping))
        .route("/update/", post(handlers::update_json))
        .route("/update/{type}/{name}/{value}", post(handlers::update_path))
        .route("/updates/", post(handlers::update_batch))
        .route("/value/", post(handlers::value_json))
        .route("/value/{type}/{name}", get(handlers::value_path))
        .layer(DefaultBodyLimit::max(middleware::BODY_LIMIT))
        .with_state(state)
}

/// Wraps `app` in the middleware stack. The last `.layer()` is the outermost.
pub(crate) fn with_middleware(app: Router, protections: Protections) -> Router {
    let mut app = app
        .layer(CatchPanicLayer::custom(middleware::handle_panic))
        .layer(from_fn(middleware::gzip_codec));

    if let Some(decryptor) = protections.decryptor {
        app = app.layer(from_fn_with_state(decryptor, middleware::decrypt_body));
    }
    if let Some(signer) = protections.signer {
        app = app.layer(from_fn_with_state(signer, middleware::verify_and_sign));
    }
    if let Some(subnet) = protections.subnet {
        app = app.layer(from_fn_with_state(
            Arc::new(subnet),
            middleware::check_subnet,
        ));
    }
    app.layer(AccessLogLayer)
}

pub(crate) fn build_router(state: AppState, protections: Protections) -> Router {
    with_middleware(routes(state), protections)
}
