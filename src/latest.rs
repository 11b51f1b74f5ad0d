//! Newest snapshot per source.
//!
//! Snapshots are stored under their own expiring keys and indexed by crawl
//! time in `hot:zset:<source>`. The index is not expired with them, so a read
//! can find a member whose data is already gone; such members are pruned.

use crate::router::KeyValueRouter;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const INDEX_PREFIX: &str = "hot:zset:";
const DATA_PREFIX: &str = "hot:data:";

#[derive(Debug, thiserror::Error)]
pub enum LatestError {
    #[error("source must be non-empty")]
    InvalidSource,
    #[error("no data for source {0}")]
    NotFound(String),
    #[error("latest data key {0} has expired")]
    Expired(String),
    #[error("stored snapshot {key} is not valid JSON: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LatestError {
    /// Absent or expired data, as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LatestError::NotFound(_) | LatestError::Expired(_))
    }
}

pub fn index_key(source: &str) -> String {
    format!("{INDEX_PREFIX}{source}")
}

pub fn data_key(source: &str, at: DateTime<Utc>) -> String {
    format!("{DATA_PREFIX}{source}:{}", at.timestamp_millis())
}

pub struct LatestFeed {
    router: Arc<KeyValueRouter>,
    snapshot_ttl: Duration,
}

impl LatestFeed {
    pub fn new(router: Arc<KeyValueRouter>, snapshot_ttl: Duration) -> Self {
        Self {
            router,
            snapshot_ttl,
        }
    }

    /// The most recent snapshot published for `source`.
    pub async fn latest(&self, source: &str) -> Result<Value, LatestError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(LatestError::InvalidSource);
        }
        let index = index_key(source);

        let route = self.router.read().await;
        let newest = route.zrevrange(&index, 0, 0).await?;
        let Some(data_key) = newest.into_iter().next() else {
            return Err(LatestError::NotFound(source.to_owned()));
        };

        let mut body = route.get(&data_key).await?;
        if body.is_none() && !route.is_fallback() {
            // A replica may not have the snapshot yet.
            body = self.router.write().await.get(&data_key).await?;
        }

        let Some(body) = body else {
            warn!(source, key = data_key.as_str(), "pruning expired snapshot from index");
            if let Err(e) = self.router.write().await.zrem(&index, &data_key).await {
                warn!(source, error = %e, "failed to prune index");
            }
            return Err(LatestError::Expired(data_key));
        };

        serde_json::from_str(&body).map_err(|source| LatestError::Malformed {
            key: data_key,
            source,
        })
    }

    /// Store a snapshot and index it by `at`. Returns the data key.
    pub async fn publish(
        &self,
        source: &str,
        payload: &Value,
        at: DateTime<Utc>,
    ) -> Result<String, LatestError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(LatestError::InvalidSource);
        }
        let key = data_key(source, at);
        let primary = self.router.write().await;
        primary
            .set(&key, &payload.to_string(), Some(self.snapshot_ttl))
            .await?;
        primary
            .zadd(&index_key(source), &key, at.timestamp_millis() as f64)
            .await?;
        debug!(source, key = key.as_str(), "snapshot published");
        Ok(key)
    }
}
