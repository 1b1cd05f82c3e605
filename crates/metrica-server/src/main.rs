//! metrica-server - metrics collector.
//!
//! Accepts metric updates over HTTP and gRPC and keeps them in memory (with
//! an optional JSON file snapshot) or in PostgreSQL.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod grpc;
mod handlers;
mod middleware;
mod router;
mod saver;
mod serve;
mod state;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use metrica_core::crypto::{BodySigner, Decryptor};
use metrica_core::repository::{MemStorage, PgStorage, Repository};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Args, ServerConfig};
use grpc::{MetricsService, PeerFilter};
use router::{Protections, build_router};
use saver::Saver;
use serve::Servers;
use state::AppState;

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["metrica_server", "metrica_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = match Args::load() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("metrica-server: {e:#}");
            process::exit(2);
        }
    };
    init_logging(args.verbose, args.quiet);

    let config = match ServerConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(config)) {
        error!(error = %format!("{e:#}"), "collector failed");
        process::exit(1);
    }
}

async fn async_main(config: ServerConfig) -> anyhow::Result<()> {
    info!(version = metrica_core::VERSION, "metrica-server starting");
    info!(
        address = %config.address,
        grpc = config.grpc_address.as_deref().unwrap_or("-"),
        store_interval_s = config.store_interval.as_secs(),
        file = ?config.file_storage_path,
        restore = config.restore,
        database = config.database_dsn.is_some(),
        signing = config.key.is_some(),
        encryption = config.crypto_key.is_some(),
        trusted_subnet = ?config.trusted_subnet.map(|s| s.network()),
        "config"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            cancel.cancel();
        }
    });

    let (repo, saver): (Arc<dyn Repository>, Option<Arc<Saver>>) = match &config.database_dsn {
        Some(dsn) => {
            let pg = PgStorage::connect(dsn.clone(), cancel.child_token())
                .await
                .context("failed to connect to database")?;
            info!("using PostgreSQL storage");
            (Arc::new(pg), None)
        }
        None => {
            let mem = Arc::new(MemStorage::new());
            let saver = config
                .file_storage_path
                .as_ref()
                .map(|path| Arc::new(Saver::new(mem.clone(), path, config.store_interval)));
            if let Some(saver) = &saver
                && config.restore
            {
                saver.restore().context("failed to restore snapshot")?;
            }
            info!(snapshot = saver.is_some(), "using in-memory storage");
            (mem, saver)
        }
    };

    let protections = Protections {
        subnet: config.trusted_subnet,
        signer: config
            .key
            .as_deref()
            .map(|k| BodySigner::new(k.as_bytes()))
            .transpose()
            .context("invalid signing key")?,
        decryptor: config
            .crypto_key
            .as_deref()
            .map(Decryptor::from_file)
            .transpose()
            .context("failed to load private key")?,
    };

    let state = AppState::new(repo, saver.clone());
    let app = build_router(state.clone(), protections);

    let http_listener = serve::bind(&config.address).await?;
    let grpc_listener = match &config.grpc_address {
        Some(address) => Some(serve::bind(address).await?),
        None => None,
    };
    info!(addr = %http_listener.local_addr()?, "listening");
    if let Some(listener) = &grpc_listener {
        info!(addr = %listener.local_addr()?, "grpc listening");
    }

    let servers = Servers {
        http: serve::spawn_http(http_listener, app, &cancel),
        grpc: grpc_listener.map(|listener| {
            serve::spawn_grpc(
                listener,
                MetricsService::new(state.clone()),
                PeerFilter::new(config.trusted_subnet),
                &cancel,
            )
        }),
    };

    let saver_loop = saver
        .clone()
        .map(|s| tokio::spawn(s.run(cancel.child_token())));

    let failed = servers.wait(&cancel).await;

    if let Some(task) = saver_loop
        && let Err(e) = task.await
    {
        warn!(error = %e, "snapshot loop panicked");
    }

    if let Some(saver) = &saver {
        match saver.save().await {
            Ok(()) => info!("final snapshot saved"),
            Err(e) => error!(error = %e, "final snapshot failed"),
        }
    }

    if failed {
        anyhow::bail!("server stopped unexpectedly");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
