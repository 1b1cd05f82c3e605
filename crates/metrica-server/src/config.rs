//! Collector configuration: CLI flags, environment, optional JSON file.
//!
//! Precedence is flag > environment > config file > built-in default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use metrica_core::crypto::TrustedSubnet;
use serde::Deserialize;

/// Metrics collector: HTTP and gRPC ingestion with memory, file or PostgreSQL storage.
#[derive(Parser, Debug)]
#[command(name = "metrica-server", about = "Metrics collector", version = metrica_core::VERSION)]
pub(crate) struct Args {
    /// HTTP listen address (host:port).
    #[arg(short, long, env = "ADDRESS", default_value = "localhost:8080")]
    pub(crate) address: String,

    /// Snapshot interval in seconds; 0 saves after every write.
    #[arg(short = 'i', long, env = "STORE_INTERVAL", default_value = "300")]
    pub(crate) store_interval: u64,

    /// Snapshot file. Empty disables snapshots.
    #[arg(short, long, env = "FILE_STORAGE_PATH", default_value = "/tmp/metrics-db.json")]
    pub(crate) file_storage_path: String,

    /// Load the snapshot file at startup.
    #[arg(short, long, env = "RESTORE", default_value_t = true, action = clap::ArgAction::Set)]
    pub(crate) restore: bool,

    /// PostgreSQL connection string. When set, metrics are stored in the database.
    #[arg(short, long, env = "DATABASE_DSN", hide_env_values = true)]
    pub(crate) database_dsn: Option<String>,

    /// Shared HMAC key for the HashSHA256 header.
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    pub(crate) key: Option<String>,

    /// Private key (PEM) used to decrypt request bodies.
    #[arg(long, env = "CRYPTO_KEY")]
    pub(crate) crypto_key: Option<PathBuf>,

    /// Only accept requests whose X-Real-IP is inside this CIDR.
    #[arg(short, long, env = "TRUSTED_SUBNET")]
    pub(crate) trusted_subnet: Option<String>,

    /// gRPC listen address. gRPC is disabled when unset.
    #[arg(short, long, env = "GRPC_ADDRESS")]
    pub(crate) grpc_address: Option<String>,

    /// JSON config file; its values apply where no flag or env var is given.
    #[arg(short, long, env = "CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    pub(crate) quiet: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    address: Option<String>,
    store_interval: Option<u64>,
    file_storage_path: Option<String>,
    restore: Option<bool>,
    database_dsn: Option<String>,
    key: Option<String>,
    crypto_key: Option<PathBuf>,
    trusted_subnet: Option<String>,
    grpc_address: Option<String>,
}

fn given(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

impl Args {
    /// Parses the process arguments and merges the config file, exiting on usage errors.
    pub(crate) fn load() -> anyhow::Result<Self> {
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

        fill!(address, store_interval, file_storage_path, restore);
        fill_opt!(database_dsn, key, crypto_key, trusted_subnet, grpc_address);
        Ok(self)
    }
}

fn read_file(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Validated collector settings.
#[derive(Debug, Clone)]
pub(crate) struct ServerConfig {
    pub(crate) address: String,
    pub(crate) store_interval: Duration,
    pub(crate) file_storage_path: Option<PathBuf>,
    pub(crate) restore: bool,
    pub(crate) database_dsn: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) crypto_key: Option<PathBuf>,
    pub(crate) trusted_subnet: Option<TrustedSubnet>,
    pub(crate) grpc_address: Option<String>,
}

impl TryFrom<Args> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        let trusted_subnet = args
            .trusted_subnet
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<TrustedSubnet>())
            .transpose()?;

        Ok(Self {
            address: args.address,
            store_interval: Duration::from_secs(args.store_interval),
            file_storage_path: Some(args.file_storage_path)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            restore: args.restore,
            database_dsn: args.database_dsn.filter(|d| !d.is_empty()),
            key: args.key.filter(|k| !k.is_empty()),
            crypto_key: args.crypto_key.filter(|p| !p.as_os_str().is_empty()),
            trusted_subnet,
            grpc_address: args.grpc_address.filter(|a| !a.is_empty()),
        })
    }
}
