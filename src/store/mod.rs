//! Key/value store capability consumed by the router, coordinator and workers.
//!
//! Every backend implements [`KvStore`]: plain strings with optional TTL, an
//! atomic create-if-absent with expiry (the dedup lock primitive), hashes
//! written together with their TTL, and a timestamp-ordered sorted set for
//! auxiliary indices.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

pub use self::memory::{MemoryCluster, MemoryStore};
pub use self::redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store connection is closed")]
    Closed,
}

impl StoreError {
    /// Whether the error means the endpoint could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::Closed
        )
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `SET key value [PX ttl]`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomic create-if-absent with expiry. Returns `true` when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// `HSET key field value...`, applying `ttl` to the whole hash in the same step.
    async fn hset(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// All fields of a hash; an absent key yields an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Members ordered by descending score, `start..=stop` inclusive (negative indices count from the end).
    async fn zrevrange(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, StoreError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Release the connection. Later operations fail with [`StoreError::Closed`].
    async fn close(&self);
}

/// Run a store round-trip under a deadline.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

/// Resolve a Redis-style inclusive `start..=stop` range against a list length.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_range_first_element() {
        assert_eq!(resolve_range(3, 0, 0), Some((0, 0)));
    }

    #[test]
    fn resolve_range_negative_indices() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
    }

    #[test]
    fn resolve_range_out_of_bounds() {
        assert_eq!(resolve_range(0, 0, 0), None);
        assert_eq!(resolve_range(3, 5, 10), None);
        assert_eq!(resolve_range(3, 2, 1), None);
        assert_eq!(resolve_range(3, 1, 100), Some((1, 2)));
    }

    #[test]
    fn connectivity_classification() {
        assert!(StoreError::Connection("refused".into()).is_connectivity());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_connectivity());
        assert!(StoreError::Closed.is_connectivity());
        assert!(!StoreError::Command("WRONGTYPE".into()).is_connectivity());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses() {
        let result: Result<(), StoreError> = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
