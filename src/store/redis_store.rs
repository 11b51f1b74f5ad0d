//! Redis-backed store over a `deadpool-redis` connection pool.

use super::{KvStore, StoreError, with_deadline};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use redis::{FromRedisValue, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Connection(e.to_string())
        } else if e.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Connection options shared by every endpoint of one deployment.
#[derive(Debug, Clone)]
pub struct RedisOptions {
    pub password: Option<String>,
    pub db: i64,
    pub pool_size: usize,
    pub timeout: Duration,
}

impl RedisOptions {
    /// Build a `redis://` URL for a `host:port` address.
    pub fn url_for(&self, addr: &str) -> String {
        match &self.password {
            Some(password) => format!("redis://:{password}@{addr}/{}", self.db),
            None => format!("redis://{addr}/{}", self.db),
        }
    }
}

pub struct RedisStore {
    addr: String,
    pool: Pool,
    timeout: Duration,
}

impl RedisStore {
    /// Create a pool for `addr`. No connection is made until first use.
    pub fn open(addr: &str, options: &RedisOptions) -> Result<Self, StoreError> {
        let mut config = Config::from_url(options.url_for(addr));
        let mut pool_config = PoolConfig::new(options.pool_size);
        pool_config.timeouts.wait = Some(options.timeout);
        pool_config.timeouts.create = Some(options.timeout);
        pool_config.timeouts.recycle = Some(options.timeout);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(format!("{addr}: {e}")))?;

        debug!(addr, pool_size = options.pool_size, "redis pool created");
        Ok(Self {
            addr: addr.to_owned(),
            pool,
            timeout: options.timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {e}", self.addr)))
    }

    /// Run one command with the store's deadline applied to checkout and round-trip.
    async fn query<T: FromRedisValue + Send>(&self, cmd: redis::Cmd) -> Result<T, StoreError> {
        with_deadline(self.timeout, async {
            let mut conn = self.conn().await?;
            Ok(cmd.query_async::<T>(&mut *conn).await?)
        })
        .await
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.query::<String>(redis::cmd("PING")).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.query::<()>(cmd).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        // Nil reply means the key already existed.
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET").arg(key);
        for (field, value) in fields {
            pipe.arg(*field).arg(*value);
        }
        pipe.ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }
        with_deadline(self.timeout, async {
            let mut conn = self.conn().await?;
            Ok(pipe.query_async::<()>(&mut *conn).await?)
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        self.query::<()>(cmd).await
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query(cmd).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(member);
        self.query::<()>(cmd).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.query::<()>(cmd).await
    }

    async fn close(&self) {
        self.pool.close();
        debug!(addr = %self.addr, "redis pool closed");
    }
}
