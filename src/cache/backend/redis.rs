use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anno_cache_api_types::StoreInfoPayload;
use async_trait::async_trait;
use futures::future::try_join_all;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::{Client, Cmd, FromRedisValue, RedisConnectionInfo, RedisError};
use tracing::{debug, info};

use super::{CacheBackend, SetCondition};
use crate::cache::config::CacheConfig;
use crate::cache::error::CacheError;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::backend::redis";
const SCAN_BATCH: usize = 500;

#[derive(Clone)]
enum Link {
    Multiplexed(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl Link {
    async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T, RedisError> {
        match self {
            Link::Multiplexed(conn) => cmd.query_async(conn).await,
            Link::Cluster(conn) => cmd.query_async(conn).await,
        }
    }

    fn is_cluster(&self) -> bool {
        matches!(self, Link::Cluster(_))
    }
}

/// Redis-backed store over a pool of multiplexed connections.
///
/// Standalone and sentinel pools hand out connections round-robin; a cluster
/// connection routes by slot itself, so its pool has a single entry.
pub struct RedisBackend {
    mode: &'static str,
    links: RwLock<Vec<Link>>,
    next: AtomicUsize,
}

fn op_error(op: &'static str) -> impl FnOnce(RedisError) -> CacheError {
    move |err| CacheError::operation(op, err.to_string())
}

fn connect_error(err: RedisError) -> CacheError {
    CacheError::connection(err.to_string())
}

impl RedisBackend {
    pub async fn standalone(config: &CacheConfig) -> Result<Self, CacheError> {
        let url = config.connection_url()?;
        let client = Client::open(url.as_str()).map_err(connect_error)?;
        let links = try_join_all((0..config.pool_size()).map(|_| async {
            client
                .get_multiplexed_async_connection()
                .await
                .map(Link::Multiplexed)
        }))
        .await
        .map_err(connect_error)?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            pool = links.len(),
            "connected to standalone cache store"
        );
        Ok(Self::from_links("standalone", links))
    }

    pub async fn sentinel(
        config: &CacheConfig,
        hosts: &[String],
        service_name: &str,
    ) -> Result<Self, CacheError> {
        if hosts.is_empty() {
            return Err(CacheError::invalid_config(
                "sentinel mode requires at least one sentinel host",
            ));
        }
        let sentinels = hosts
            .iter()
            .map(|host| format!("redis://{host}"))
            .collect::<Vec<_>>();
        let mut sentinel = Sentinel::build(sentinels).map_err(connect_error)?;

        let master = sentinel
            .async_master_for(service_name, Some(&master_node_info(config)))
            .await
            .map_err(connect_error)?;
        let links = try_join_all((0..config.pool_size()).map(|_| async {
            master
                .get_multiplexed_async_connection()
                .await
                .map(Link::Multiplexed)
        }))
        .await
        .map_err(connect_error)?;

        info!(
            service = service_name,
            sentinels = hosts.len(),
            pool = links.len(),
            "connected to sentinel-managed cache master"
        );
        Ok(Self::from_links("sentinel", links))
    }

    pub async fn cluster(config: &CacheConfig, nodes: &[String]) -> Result<Self, CacheError> {
        if nodes.is_empty() {
            return Err(CacheError::invalid_config(
                "cluster mode requires at least one cluster node",
            ));
        }
        let urls = nodes
            .iter()
            .map(|node| format!("redis://{node}"))
            .collect::<Vec<_>>();
        let mut builder = ClusterClient::builder(urls);
        if let Some(password) = config.password.clone().filter(|p| !p.is_empty()) {
            builder = builder.password(password);
        }
        let client = builder.build().map_err(connect_error)?;
        let conn = client.get_async_connection().await.map_err(connect_error)?;

        info!(nodes = nodes.len(), "connected to cache cluster");
        Ok(Self::from_links("cluster", vec![Link::Cluster(conn)]))
    }

    fn from_links(mode: &'static str, links: Vec<Link>) -> Self {
        Self {
            mode,
            links: RwLock::new(links),
            next: AtomicUsize::new(0),
        }
    }

    fn link(&self, op: &'static str) -> Result<Link, CacheError> {
        let links = rw_read(&self.links, SOURCE, op);
        if links.is_empty() {
            return Err(CacheError::NotConnected);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % links.len();
        Ok(links[index].clone())
    }

    async fn run<T: FromRedisValue>(&self, op: &'static str, cmd: &Cmd) -> Result<T, CacheError> {
        let mut link = self.link(op)?;
        link.query(cmd).await.map_err(op_error(op))
    }

    async fn scan_cursor(link: &mut Link, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) =
                link.query(&cmd).await.map_err(op_error("scan"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Connection settings applied to the master once a sentinel has resolved it.
fn master_node_info(config: &CacheConfig) -> SentinelNodeConnectionInfo {
    SentinelNodeConnectionInfo {
        tls_mode: None,
        redis_connection_info: Some(RedisConnectionInfo {
            db: config.db,
            password: config.password.clone().filter(|p| !p.is_empty()),
            ..Default::default()
        }),
    }
}

fn parse_info(raw: &str, db_size: u64) -> StoreInfoPayload {
    let mut info = StoreInfoPayload {
        db_size,
        ..Default::default()
    };
    for line in raw.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        let number = || value.parse::<u64>().unwrap_or_default();
        match field {
            "used_memory" => info.used_memory_bytes = number(),
            "used_memory_human" => info.used_memory_human = Some(value.to_string()),
            "connected_clients" => info.connected_clients = number(),
            "total_commands_processed" => info.total_commands_processed = number(),
            "keyspace_hits" => info.keyspace_hits = number(),
            "keyspace_misses" => info.keyspace_misses = number(),
            _ => {}
        }
    }
    info
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        self.mode
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let _: String = self.run("ping", &redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.run("get", redis::cmd("GET").arg(key)).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut link = self.link("mget")?;
        if link.is_cluster() {
            // Keys may hash to different slots.
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                let value: Option<Vec<u8>> = link
                    .query(redis::cmd("GET").arg(key))
                    .await
                    .map_err(op_error("mget"))?;
                values.push(value);
            }
            return Ok(values);
        }
        link.query(redis::cmd("MGET").arg(keys))
            .await
            .map_err(op_error("mget"))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        condition: SetCondition,
    ) -> Result<bool, CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl.as_secs().max(1));
        match condition {
            SetCondition::Always => {}
            SetCondition::IfAbsent => {
                cmd.arg("NX");
            }
            SetCondition::IfPresent => {
                cmd.arg("XX");
            }
        }
        let reply: Option<String> = self.run("set", &cmd).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut link = self.link("delete")?;
        if link.is_cluster() {
            let mut removed = 0;
            for key in keys {
                let count: u64 = link
                    .query(redis::cmd("DEL").arg(key))
                    .await
                    .map_err(op_error("delete"))?;
                removed += count;
            }
            return Ok(removed);
        }
        link.query(redis::cmd("DEL").arg(keys))
            .await
            .map_err(op_error("delete"))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let count: u64 = self.run("exists", redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.run("ttl", redis::cmd("TTL").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let updated: u64 = self
            .run(
                "expire",
                redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut link = self.link("scan")?;
        if link.is_cluster() {
            // KEYS is fanned out to every primary by the cluster client.
            let mut keys: Vec<String> = link
                .query(redis::cmd("KEYS").arg(pattern))
                .await
                .map_err(op_error("scan"))?;
            keys.sort();
            return Ok(keys);
        }
        Self::scan_cursor(&mut link, pattern).await
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        let _: String = self.run("flush_all", &redis::cmd("FLUSHDB")).await?;
        Ok(())
    }

    async fn info(&self) -> Result<StoreInfoPayload, CacheError> {
        let raw: String = self.run("info", &redis::cmd("INFO")).await?;
        let db_size: u64 = self.run("info", &redis::cmd("DBSIZE")).await?;
        Ok(parse_info(&raw, db_size))
    }

    async fn close(&self) {
        let drained = std::mem::take(&mut *rw_write(&self.links, SOURCE, "close"));
        debug!(mode = self.mode, connections = drained.len(), "closed cache connections");
    }
}
