//! Configuration module for the hotquery application.
//!
//! Values are layered with figment: built-in defaults, then an optional TOML
//! file, then raw environment variables (`PORT`, `CACHE_TTL`, ...). Durations
//! accept either a bare number of seconds or a human string like `"30s"` or
//! `"10m"`.

use crate::replica::AddressMap;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the TOML file to layer under the environment.
pub const CONFIG_PATH_ENV: &str = "HOTQUERY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "hotquery.toml";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log level for the hotquery crate itself; dependencies log at `warn`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Graceful shutdown budget for in-flight jobs and requests
    #[serde(default = "default_shutdown_timeout", deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
    /// Deadline for a single HTTP request
    #[serde(default = "default_request_timeout", deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,

    /// Sentinel endpoints; when set, the primary and replicas are discovered through them.
    #[serde(default)]
    pub sentinel_addrs: Vec<String>,
    /// Fixed primary used when no sentinels are configured.
    #[serde(default)]
    pub primary_addr: Option<String>,
    /// Fixed replicas used together with `primary_addr`.
    #[serde(default)]
    pub replica_addrs: Vec<String>,
    #[serde(default = "default_master_name")]
    pub master_name: String,
    #[serde(default)]
    pub redis_password: Option<String>,
    #[serde(default)]
    pub redis_db: i64,
    #[serde(default = "default_pool_size")]
    pub redis_pool_size: usize,
    /// Rewrites discovered addresses into ones reachable from this process.
    #[serde(default)]
    pub address_map: AddressMap,
    #[serde(default = "default_refresh_interval", deserialize_with = "deserialize_duration")]
    pub replica_refresh_interval: Duration,
    #[serde(default = "default_store_timeout", deserialize_with = "deserialize_duration")]
    pub store_timeout: Duration,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub queue_backend: QueueBackend,
    /// Broker URL; defaults to the current primary.
    #[serde(default)]
    pub queue_url: Option<String>,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default)]
    pub search_shards: Vec<String>,
    #[serde(default = "default_search_timeout", deserialize_with = "deserialize_duration")]
    pub search_timeout: Duration,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    #[serde(default = "default_cache_ttl", deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    #[serde(default = "default_lock_ttl", deserialize_with = "deserialize_duration")]
    pub lock_ttl: Duration,
    #[serde(default = "default_request_ttl", deserialize_with = "deserialize_duration")]
    pub request_ttl: Duration,
    #[serde(default = "default_publish_timeout", deserialize_with = "deserialize_duration")]
    pub publish_timeout: Duration,
    /// Lifetime of snapshots written to the latest feed
    #[serde(default = "default_snapshot_ttl", deserialize_with = "deserialize_duration")]
    pub snapshot_ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("request_ttl ({request:?}) must not exceed cache_ttl ({cache:?})")]
    RequestOutlivesCache { request: Duration, cache: Duration },
    #[error("lock_ttl ({lock:?}) must exceed publish_timeout ({publish:?})")]
    LockTooShort { lock: Duration, publish: Duration },
    #[error("worker_concurrency must be at least 1")]
    NoWorkers,
    #[error("search_limit must be at least 1")]
    NoResults,
    #[error("queue_backend = \"redis\" needs queue_url or a store (sentinel_addrs or primary_addr)")]
    QueueWithoutBroker,
}

impl Config {
    /// Layer defaults, the TOML file at `path` (if it exists) and the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::raw())
    }

    /// Load from the file named by `HOTQUERY_CONFIG` (default `hotquery.toml`) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let from_env = std::env::var(CONFIG_PATH_ENV).ok();
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| from_env.map(Into::into))
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
        Self::figment(&path).extract()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_ttl > self.cache_ttl {
            return Err(ConfigError::RequestOutlivesCache {
                request: self.request_ttl,
                cache: self.cache_ttl,
            });
        }
        if self.lock_ttl <= self.publish_timeout {
            return Err(ConfigError::LockTooShort {
                lock: self.lock_ttl,
                publish: self.publish_timeout,
            });
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.search_limit == 0 {
            return Err(ConfigError::NoResults);
        }
        if self.queue_backend == QueueBackend::Redis
            && self.queue_url.is_none()
            && !self.has_external_store()
        {
            return Err(ConfigError::QueueWithoutBroker);
        }
        Ok(())
    }

    /// Whether a real store is configured, as opposed to the in-process one.
    pub fn has_external_store(&self) -> bool {
        !self.sentinel_addrs.is_empty() || self.primary_addr.is_some()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_master_name() -> String {
    "mymaster".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_queue_name() -> String {
    "fuzzy-query-queue".to_string()
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_search_limit() -> usize {
    50
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_request_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn duration_parser() -> DurationParser<'static> {
    DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
}

/// Parse `"250ms"`, `"30s"`, `"10m"`, `"2h"`; a bare number means seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let parsed = duration_parser()
        .parse(input.trim())
        .map_err(|e| format!("invalid duration '{input}': {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration '{input}': {e}"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
