//! Agent configuration: CLI flags, environment, optional JSON file.
//!
//! Precedence is flag > environment > config file > built-in default.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::Deserialize;

/// How metrics are encoded for the HTTP collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// `POST /update/{type}/{name}/{value}`, one request per metric.
    Query,
    /// One JSON envelope per request.
    Json,
    /// One JSON array per report cycle.
    Batch,
}

/// Metrics agent: samples runtime and host stats and reports them to the collector.
#[derive(Parser, Debug)]
#[command(name = "metrica-agent", about = "Metrics agent", version = metrica_core::VERSION)]
pub struct Args {
    /// Collector HTTP address (host:port).
    #[arg(short, long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Collector gRPC address. When set, metrics are sent over gRPC instead of HTTP.
    #[arg(short, long, env = "GRPC_ADDRESS")]
    pub grpc_address: Option<String>,

    /// HTTP report mode.
    #[arg(short, long, env = "REPORT_MODE", value_enum, default_value = "batch")]
    pub mode: ReportMode,

    /// Shared HMAC key for the HashSHA256 header.
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Collector public key (PEM) used to encrypt bodies.
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Report interval in seconds.
    #[arg(short, long, env = "REPORT_INTERVAL", default_value = "10")]
    pub report_interval: u64,

    /// Poll interval in seconds.
    #[arg(short, long, env = "POLL_INTERVAL", default_value = "2")]
    pub poll_interval: u64,

    /// Maximum outbound requests per second.
    #[arg(short = 'l', long, env = "RATE_LIMIT", default_value = "1")]
    pub rate_limit: u32,

    /// Concurrent senders per report cycle. Defaults to the rate limit.
    #[arg(short, long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// Path to the proc filesystem.
    #[arg(long, env = "PROC_PATH", default_value = "/proc")]
    pub proc_path: PathBuf,

    /// JSON config file; its values apply where no flag or env var is given.
    #[arg(short, long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Config file layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    address: Option<String>,
    grpc_address: Option<String>,
    mode: Option<ReportMode>,
    key: Option<String>,
    crypto_key: Option<PathBuf>,
    report_interval: Option<u64>,
    poll_interval: Option<u64>,
    rate_limit: Option<u32>,
    workers: Option<usize>,
    proc_path: Option<PathBuf>,
}

fn given(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

impl Args {
    /// Parses the process arguments and merges the config file, exiting on usage errors.
    pub fn load() -> anyhow::Result<Self> {
        let matches = Args::command().get_matches();
        let args = Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
        args.merge_file(&matches)
    }

    fn merge_file(mut self, matches: &ArgMatches) -> anyhow::Result<Self> {
        let Some(path) = self.config.clone() else {
            return Ok(self);
        };
        let file = read_file(&path)?;

        macro_rules! fill {
            ($($field:ident),*) => {$(
                if let Some(v) = file.$field && !given(matches, stringify!($field)) {
                    self.$field = v;
                }
            )*};
        }
        macro_rules! fill_opt {
            ($($field:ident),*) => {$(
                if let Some(v) = file.$field && !given(matches, stringify!($field)) {
                    self.$field = Some(v);
                }
            )*};
        }

        fill!(address, mode, report_interval, poll_interval, rate_limit, proc_path);
        fill_opt!(grpc_address, key, crypto_key, workers);
        Ok(self)
    }
}

fn read_file(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Validated agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: String,
    pub grpc_address: Option<String>,
    pub mode: ReportMode,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub report_interval: Duration,
    pub poll_interval: Duration,
    pub rate_limit: NonZeroU32,
    pub workers: usize,
    pub proc_path: PathBuf,
}

impl TryFrom<Args> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        if args.report_interval == 0 {
            bail!("report interval must be positive");
        }
        if args.poll_interval == 0 {
            bail!("poll interval must be positive");
        }
        let rate_limit =
            NonZeroU32::new(args.rate_limit).context("rate limit must be positive")?;
        let workers = args
            .workers
            .filter(|w| *w > 0)
            .unwrap_or(rate_limit.get() as usize);

        Ok(Self {
            address: args.address,
            grpc_address: args.grpc_address.filter(|a| !a.is_empty()),
            mode: args.mode,
            key: args.key.filter(|k| !k.is_empty()),
            crypto_key: args.crypto_key.filter(|p| !p.as_os_str().is_empty()),
            report_interval: Duration::from_secs(args.report_interval),
            poll_interval: Duration::from_secs(args.poll_interval),
            rate_limit,
            workers,
            proc_path: args.proc_path,
        })
    }
}
