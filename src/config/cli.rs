use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the anno-cache daemon.
#[derive(Debug, Parser)]
#[command(name = "anno-cache", version, about = "Annotation platform cache daemon")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ANNO_CACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the background maintenance worker until interrupted.
    Run(Box<RunArgs>),
    /// Connect to the store, run a health probe and exit.
    Check(CheckArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: StoreOverrides,
}

/// Overrides shared by every command that talks to the store.
#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the store host.
    #[arg(long = "cache-host", value_name = "HOST")]
    pub cache_host: Option<String>,

    /// Override the store port.
    #[arg(long = "cache-port", value_name = "PORT")]
    pub cache_port: Option<u16>,

    /// Override the store password.
    #[arg(long = "cache-password", env = "ANNO_CACHE_PASSWORD", value_name = "PASSWORD")]
    pub cache_password: Option<String>,

    /// Override the logical database index.
    #[arg(long = "cache-db", value_name = "INDEX")]
    pub cache_db: Option<i64>,

    /// Deployment mode: standalone, sentinel, cluster or memory.
    #[arg(long = "cache-mode", value_name = "MODE")]
    pub cache_mode: Option<String>,

    /// Override the log level (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Override the maintenance cycle interval.
    #[arg(long = "worker-interval-seconds", value_name = "SECONDS")]
    pub worker_interval_seconds: Option<u64>,

    /// Warm recently used entities before the first cycle.
    #[arg(
        long = "worker-warm-on-start",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub worker_warm_on_start: Option<bool>,

    /// Override the number of entities warmed per batch.
    #[arg(long = "worker-warm-batch-size", value_name = "COUNT")]
    pub worker_warm_batch_size: Option<u64>,
}
