//! metrica-agent - runtime and host metrics agent.
//!
//! Polls jemalloc statistics and `/proc` host stats into a local repository
//! and periodically reports the repository to the collector over HTTP or gRPC.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod host;
mod netaddr;
mod poller;
mod reporter;
mod runtime;
mod sender;

use std::process;
use std::sync::Arc;

use metrica_core::repository::MemStorage;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{AgentConfig, Args};
use poller::Poller;
use reporter::Reporter;
use sender::Transport;

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
    for target in ["metrica_agent", "metrica_core"] {
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
            eprintln!("metrica-agent: {e:#}");
            process::exit(2);
        }
    };
    init_logging(args.verbose, args.quiet);

    let config = match AgentConfig::try_from(args) {
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
        error!(error = %e, "agent failed");
        process::exit(1);
    }
}

async fn async_main(config: AgentConfig) -> anyhow::Result<()> {
    info!(version = metrica_core::VERSION, "metrica-agent starting");
    info!(
        address = %config.address,
        grpc = config.grpc_address.as_deref().unwrap_or("-"),
        mode = ?config.mode,
        poll_s = config.poll_interval.as_secs(),
        report_s = config.report_interval.as_secs(),
        rate_limit = config.rate_limit.get(),
        workers = config.workers,
        signing = config.key.is_some(),
        encryption = config.crypto_key.is_some(),
        "config"
    );

    let transport = Transport::from_config(&config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            cancel.cancel();
        }
    });

    let repo = Arc::new(MemStorage::new());
    let poller = Poller::new(repo.clone(), &config.proc_path, StdRng::from_os_rng());
    let reporter = Reporter::new(repo, transport, config.workers, config.rate_limit);

    let poll = tokio::spawn(poller.run(config.poll_interval, cancel.child_token()));
    let report = tokio::spawn(reporter.run(config.report_interval, cancel.child_token()));

    let (poll, report) = tokio::join!(poll, report);
    if let Err(e) = poll {
        warn!(error = %e, "poll loop panicked");
    }
    if let Err(e) = report {
        warn!(error = %e, "report loop panicked");
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
