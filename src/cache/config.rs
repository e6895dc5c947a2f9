//! Cache configuration.
//!
//! Built once from the resolved settings and treated as immutable afterwards.
//! Invariant violations are reported as warnings by [`CacheConfig::validate`]
//! rather than failing startup.

use std::time::Duration;

use url::Url;

use super::error::CacheError;

// Default values for cache configuration
pub(crate) const DEFAULT_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_PORT: u16 = 6379;
pub(crate) const DEFAULT_DB: i64 = 0;
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 20;
pub(crate) const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_SOCKET_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_TTL_SECS: u64 = 3_600;
pub(crate) const DEFAULT_MAX_TTL_SECS: u64 = 86_400;
pub(crate) const DEFAULT_COMPRESSION_THRESHOLD: usize = 1_024;
pub(crate) const DEFAULT_SENTINEL_SERVICE: &str = "mymaster";
pub(crate) const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Deployment topology of the key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentMode {
    /// A single server reached through a pool of connections.
    Standalone,
    /// Master discovered through a set of sentinels (`host:port`).
    Sentinel {
        hosts: Vec<String>,
        service_name: String,
    },
    /// Cluster reached through seed nodes (`host:port`).
    Cluster { nodes: Vec<String> },
    /// In-process store for development and tests.
    Memory { capacity: usize },
}

impl DeploymentMode {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentMode::Standalone => "standalone",
            DeploymentMode::Sentinel { .. } => "sentinel",
            DeploymentMode::Cluster { .. } => "cluster",
            DeploymentMode::Memory { .. } => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Upper bound on pooled connections.
    pub max_connections: usize,
    /// Bound on every individual store call.
    pub socket_timeout: Duration,
    /// Bound on establishing the pool.
    pub socket_connect_timeout: Duration,
    pub default_ttl: Duration,
    /// Hard ceiling; larger requested TTLs are clamped.
    pub max_ttl: Duration,
    /// Encoded payloads larger than this are compressed when it helps.
    pub compression_threshold: usize,
    pub mode: DeploymentMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: DEFAULT_DB,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            socket_connect_timeout: Duration::from_millis(DEFAULT_SOCKET_CONNECT_TIMEOUT_MS),
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_ttl: Duration::from_secs(DEFAULT_MAX_TTL_SECS),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            mode: DeploymentMode::Standalone,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            password: settings.password.clone(),
            db: settings.db,
            max_connections: settings.max_connections.get(),
            socket_timeout: settings.socket_timeout,
            socket_connect_timeout: settings.socket_connect_timeout,
            default_ttl: settings.default_ttl,
            max_ttl: settings.max_ttl,
            compression_threshold: settings.compression_threshold,
            mode: settings.mode.clone(),
        }
    }
}

impl CacheConfig {
    /// In-process configuration, used by tests and local development.
    pub fn memory() -> Self {
        Self {
            mode: DeploymentMode::Memory {
                capacity: DEFAULT_MEMORY_CAPACITY,
            },
            ..Default::default()
        }
    }

    /// Check the documented invariants, returning one message per violation.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.max_ttl < self.default_ttl {
            warnings.push(format!(
                "max_ttl ({}s) is lower than default_ttl ({}s); default writes will be clamped",
                self.max_ttl.as_secs(),
                self.default_ttl.as_secs()
            ));
        }
        if self.default_ttl.is_zero() {
            warnings.push("default_ttl is zero; entries will be written with a 1s TTL".to_string());
        }
        if self.max_connections == 0 {
            warnings.push("max_connections is zero; a single connection will be used".to_string());
        }
        if self.socket_timeout.is_zero() {
            warnings.push("socket_timeout is zero; every store call will time out".to_string());
        }

        match &self.mode {
            DeploymentMode::Sentinel {
                hosts,
                service_name,
            } => {
                if hosts.is_empty() {
                    warnings.push("sentinel mode requires at least one sentinel host".to_string());
                }
                if service_name.trim().is_empty() {
                    warnings.push("sentinel mode requires a service name".to_string());
                }
            }
            DeploymentMode::Cluster { nodes } if nodes.is_empty() => {
                warnings.push("cluster mode requires at least one cluster node".to_string());
            }
            DeploymentMode::Memory { capacity } if *capacity == 0 => {
                warnings.push("memory mode capacity is zero; one entry will be kept".to_string());
            }
            _ => {}
        }

        warnings
    }

    /// Connection URL of the standalone server.
    pub fn connection_url(&self) -> Result<String, CacheError> {
        self.url_for(&format!("{}:{}", self.host, self.port))
    }

    /// Connection URL for an arbitrary `host:port` node, carrying credentials and db.
    pub fn url_for(&self, node: &str) -> Result<String, CacheError> {
        let mut url = Url::parse(&format!("redis://{node}"))
            .map_err(|err| CacheError::invalid_config(format!("invalid node `{node}`: {err}")))?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password)).map_err(|()| {
                CacheError::invalid_config(format!("cannot attach credentials to `{node}`"))
            })?;
        }
        url.set_path(&format!("/{}", self.db));
        Ok(url.into())
    }

    /// Effective TTL for a write: default when unspecified, clamped to the ceiling.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        let ttl = requested.unwrap_or(self.default_ttl).min(self.max_ttl);
        ttl.max(Duration::from_secs(1))
    }

    /// Pool size with the zero case clamped to one.
    pub fn pool_size(&self) -> usize {
        self.max_connections.max(1)
    }
}
