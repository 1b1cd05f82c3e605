//! Server start-up and shutdown.
//!
//! Listeners are bound before any server task starts, so an occupied port
//! fails start-up. Once running, the servers stop when the root token fires
//! or when either of them exits on its own, which also fires the token.

use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use metrica_core::grpc::metrics_server::MetricsServer;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::grpc::{MetricsService, PeerFilter};

/// Time each server gets to drain after shutdown starts.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type HttpTask = JoinHandle<std::io::Result<()>>;
type GrpcTask = JoinHandle<Result<(), tonic::transport::Error>>;

/// Accepts `:port` as shorthand for all interfaces.
pub(crate) fn listen_addr(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_owned()
    }
}

pub(crate) async fn bind(address: &str) -> anyhow::Result<TcpListener> {
    let address = listen_addr(address);
    TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))
}

pub(crate) fn spawn_http(listener: TcpListener, app: Router, cancel: &CancellationToken) -> HttpTask {
    let shutdown = cancel.clone().cancelled_owned();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    })
}

pub(crate) fn spawn_grpc(
    listener: TcpListener,
    service: MetricsService,
    filter: PeerFilter,
    cancel: &CancellationToken,
) -> GrpcTask {
    let shutdown = cancel.clone().cancelled_owned();
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(MetricsServer::with_interceptor(service, filter))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown),
    )
}

enum Exit {
    Http(Result<std::io::Result<()>, JoinError>),
    Grpc(Result<Result<(), tonic::transport::Error>, JoinError>),
}

/// Running server tasks.
pub(crate) struct Servers {
    pub(crate) http: HttpTask,
    pub(crate) grpc: Option<GrpcTask>,
}

impl Servers {
    /// Waits for cancellation or for a server to exit early, then drains
    /// the rest within [`SHUTDOWN_GRACE`]. Returns true if any server failed.
    pub(crate) async fn wait(self, cancel: &CancellationToken) -> bool {
        let Servers { mut http, mut grpc } = self;

        let early = tokio::select! {
            _ = cancel.cancelled() => None,
            res = &mut http => Some(Exit::Http(res)),
            Some(res) = async {
                match grpc.as_mut() {
                    Some(task) => Some(task.await),
                    None => None,
                }
            } => Some(Exit::Grpc(res)),
        };
        cancel.cancel();

        let mut failed = early.is_some();
        let mut http = Some(http);
        match early {
            Some(Exit::Http(res)) => {
                report("http", res);
                http = None;
            }
            Some(Exit::Grpc(res)) => {
                report("grpc", res);
                grpc = None;
            }
            None => {}
        }

        let (http_failed, grpc_failed) = tokio::join!(drain("http", http), drain("grpc", grpc));
        failed |= http_failed || grpc_failed;
        failed
    }
}

/// Logs how a server task ended. Returns true on failure.
fn report<E: Display>(server: &'static str, res: Result<Result<(), E>, JoinError>) -> bool {
    match res {
        Ok(Ok(())) => {
            info!(server, "server stopped");
            false
        }
        Ok(Err(e)) => {
            error!(server, error = %e, "server failed");
            true
        }
        Err(e) => {
            error!(server, error = %e, "server task panicked");
            true
        }
    }
}

async fn drain<E: Display>(
    server: &'static str,
    task: Option<JoinHandle<Result<(), E>>>,
) -> bool {
    let Some(mut task) = task else {
        return false;
    };
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
        Ok(res) => report(server, res),
        Err(_) => {
            warn!(server, grace_s = SHUTDOWN_GRACE.as_secs(), "server did not drain in time");
            task.abort();
            false
        }
    }
}
