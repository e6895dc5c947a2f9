//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::config::{
    DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_DB, DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_TTL_SECS, DEFAULT_MEMORY_CAPACITY, DEFAULT_PORT, DEFAULT_SENTINEL_SERVICE,
    DEFAULT_SOCKET_CONNECT_TIMEOUT_MS, DEFAULT_SOCKET_TIMEOUT_MS, DEFAULT_TTL_SECS,
    DeploymentMode,
};

mod cli;

pub use cli::{CheckArgs, CliArgs, Command, RunArgs, RunOverrides, StoreOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "anno-cache";
const ENV_PREFIX: &str = "ANNO_CACHE";
const DEFAULT_WORKER_INTERVAL_SECS: u64 = 300;
const DEFAULT_WARM_BATCH_SIZE: u64 = 50;
const DEFAULT_WARM_PAUSE_MS: u64 = 100;
const DEFAULT_BATCH_RETENTION_HOURS: u64 = 24;
const DEFAULT_STATS_TTL_SECS: u64 = 300;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub max_connections: NonZeroUsize,
    pub socket_timeout: Duration,
    pub socket_connect_timeout: Duration,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub compression_threshold: usize,
    pub mode: DeploymentMode,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub warm_on_start: bool,
    pub warm_batch_size: NonZeroUsize,
    pub warm_pause: Duration,
    pub batch_retention: Duration,
    pub stats_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("cache.sentinel_hosts")
            .with_list_parse_key("cache.cluster_nodes"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Run(args)) => raw.apply_run_overrides(&args.overrides),
        Some(Command::Check(args)) => raw.apply_store_overrides(&args.overrides),
        None => raw.apply_run_overrides(&RunOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
    worker: RawWorkerSettings,
}

impl RawSettings {
    fn apply_run_overrides(&mut self, overrides: &RunOverrides) {
        self.apply_store_overrides(&overrides.store);
        if let Some(seconds) = overrides.worker_interval_seconds {
            self.worker.interval_seconds = Some(seconds);
        }
        if let Some(warm) = overrides.worker_warm_on_start {
            self.worker.warm_on_start = Some(warm);
        }
        if let Some(size) = overrides.worker_warm_batch_size {
            self.worker.warm_batch_size = Some(size);
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(host) = overrides.cache_host.as_ref() {
            self.cache.host = Some(host.clone());
        }
        if let Some(port) = overrides.cache_port {
            self.cache.port = Some(port);
        }
        if let Some(password) = overrides.cache_password.as_ref() {
            self.cache.password = Some(password.clone());
        }
        if let Some(db) = overrides.cache_db {
            self.cache.db = Some(db);
        }
        if let Some(mode) = overrides.cache_mode.as_ref() {
            self.cache.mode = Some(mode.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            logging,
            worker,
        } = raw;

        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;
        let worker = build_worker_settings(worker)?;

        Ok(Self {
            cache,
            logging,
            worker,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let host = non_empty(cache.host).unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = cache.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "cache.port",
            "port must be greater than zero",
        ));
    }

    let db = cache.db.unwrap_or(DEFAULT_DB);
    if db < 0 {
        return Err(LoadError::invalid("cache.db", "must not be negative"));
    }

    let max_connections = non_zero_usize(
        cache
            .max_connections
            .unwrap_or(DEFAULT_MAX_CONNECTIONS as u64),
        "cache.max_connections",
    )?;

    let socket_timeout = positive_duration(
        cache.socket_timeout_ms.unwrap_or(DEFAULT_SOCKET_TIMEOUT_MS),
        "cache.socket_timeout_ms",
        Duration::from_millis,
    )?;
    let socket_connect_timeout = positive_duration(
        cache
            .socket_connect_timeout_ms
            .unwrap_or(DEFAULT_SOCKET_CONNECT_TIMEOUT_MS),
        "cache.socket_connect_timeout_ms",
        Duration::from_millis,
    )?;

    let default_ttl = Duration::from_secs(cache.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECS));
    let max_ttl = Duration::from_secs(cache.max_ttl_seconds.unwrap_or(DEFAULT_MAX_TTL_SECS));

    let compression_threshold = match cache.compression_threshold_bytes {
        Some(bytes) => usize::try_from(bytes).map_err(|_| {
            LoadError::invalid(
                "cache.compression_threshold_bytes",
                "value exceeds supported range for usize",
            )
        })?,
        None => DEFAULT_COMPRESSION_THRESHOLD,
    };

    let mode = build_deployment_mode(
        cache.mode,
        cache.sentinel_hosts,
        cache.sentinel_service_name,
        cache.cluster_nodes,
        cache.memory_capacity,
    )?;

    Ok(CacheSettings {
        host,
        port,
        password: non_empty(cache.password),
        db,
        max_connections,
        socket_timeout,
        socket_connect_timeout,
        default_ttl,
        max_ttl,
        compression_threshold,
        mode,
    })
}

fn build_deployment_mode(
    mode: Option<String>,
    sentinel_hosts: Vec<String>,
    sentinel_service_name: Option<String>,
    cluster_nodes: Vec<String>,
    memory_capacity: Option<u64>,
) -> Result<DeploymentMode, LoadError> {
    let mode = mode.unwrap_or_default().trim().to_ascii_lowercase();
    match mode.as_str() {
        "" | "standalone" => Ok(DeploymentMode::Standalone),
        "sentinel" => Ok(DeploymentMode::Sentinel {
            hosts: trimmed_list(sentinel_hosts),
            service_name: non_empty(sentinel_service_name)
                .unwrap_or_else(|| DEFAULT_SENTINEL_SERVICE.to_string()),
        }),
        "cluster" => Ok(DeploymentMode::Cluster {
            nodes: trimmed_list(cluster_nodes),
        }),
        "memory" => Ok(DeploymentMode::Memory {
            capacity: non_zero_usize(
                memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY as u64),
                "cache.memory_capacity",
            )?
            .get(),
        }),
        other => Err(LoadError::invalid(
            "cache.mode",
            format!("unknown mode `{other}`; expected standalone, sentinel, cluster or memory"),
        )),
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let interval = positive_duration(
        worker
            .interval_seconds
            .unwrap_or(DEFAULT_WORKER_INTERVAL_SECS),
        "worker.interval_seconds",
        Duration::from_secs,
    )?;
    let warm_batch_size = non_zero_usize(
        worker.warm_batch_size.unwrap_or(DEFAULT_WARM_BATCH_SIZE),
        "worker.warm_batch_size",
    )?;
    let warm_pause = Duration::from_millis(worker.warm_pause_ms.unwrap_or(DEFAULT_WARM_PAUSE_MS));
    let batch_retention = positive_duration(
        worker
            .batch_retention_hours
            .unwrap_or(DEFAULT_BATCH_RETENTION_HOURS),
        "worker.batch_retention_hours",
        |hours| Duration::from_secs(hours.saturating_mul(3_600)),
    )?;
    let stats_ttl = positive_duration(
        worker.stats_ttl_seconds.unwrap_or(DEFAULT_STATS_TTL_SECS),
        "worker.stats_ttl_seconds",
        Duration::from_secs,
    )?;

    Ok(WorkerSettings {
        interval,
        warm_on_start: worker.warm_on_start.unwrap_or(false),
        warm_batch_size,
        warm_pause,
        batch_retention,
        stats_ttl,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    db: Option<i64>,
    max_connections: Option<u64>,
    socket_timeout_ms: Option<u64>,
    socket_connect_timeout_ms: Option<u64>,
    default_ttl_seconds: Option<u64>,
    max_ttl_seconds: Option<u64>,
    compression_threshold_bytes: Option<u64>,
    mode: Option<String>,
    sentinel_hosts: Vec<String>,
    sentinel_service_name: Option<String>,
    cluster_nodes: Vec<String>,
    memory_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    interval_seconds: Option<u64>,
    warm_on_start: Option<bool>,
    warm_batch_size: Option<u64>,
    warm_pause_ms: Option<u64>,
    batch_retention_hours: Option<u64>,
    stats_ttl_seconds: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn trimmed_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|value| non_empty(Some(value)))
        .collect()
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(
    value: u64,
    key: &'static str,
    unit: impl FnOnce(u64) -> Duration,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

#[cfg(test)]
mod tests;
