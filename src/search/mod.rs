//! The search capability consumed by workers.
//!
//! [`ShardedSearch`] queries every shard concurrently, drops failed shards,
//! validates hits into [`Document`]s and reduces them with [`dedup_and_rank`].

pub mod document;
pub mod http;
pub mod merge;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::utils::fmt_duration;

pub use self::document::{Document, HotItem};
pub use self::http::HttpShard;
pub use self::merge::{dedup_and_rank, validate};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("shard {shard} failed: {source}")]
    Shard {
        shard: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("all {0} search shards failed")]
    AllShardsFailed(usize),
    #[error("search timed out after {0:?}")]
    Timeout(Duration),
}

/// search(keyword) -> ranked documents.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, keyword: &str) -> Result<Vec<Document>, SearchError>;
}

/// One partition of the searchable data, returning raw hits.
#[async_trait]
pub trait SearchShard: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, keyword: &str) -> Result<Vec<Value>, SearchError>;
}

pub struct ShardedSearch {
    shards: Vec<Arc<dyn SearchShard>>,
    limit: usize,
}

impl ShardedSearch {
    pub fn new(shards: Vec<Arc<dyn SearchShard>>, limit: usize) -> Self {
        Self { shards, limit }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[async_trait]
impl SearchBackend for ShardedSearch {
    async fn search(&self, keyword: &str) -> Result<Vec<Document>, SearchError> {
        let start = Instant::now();
        let results = join_all(self.shards.iter().map(|shard| shard.query(keyword))).await;

        let mut failed = 0;
        let mut hits = Vec::new();
        for (shard, result) in self.shards.iter().zip(results) {
            match result {
                Ok(mut shard_hits) => hits.append(&mut shard_hits),
                Err(e) => {
                    failed += 1;
                    warn!(shard = shard.name(), error = %e, "search shard failed, excluding it");
                }
            }
        }
        if failed > 0 && failed == self.shards.len() {
            return Err(SearchError::AllShardsFailed(failed));
        }

        let (docs, skipped) = validate(hits);
        let ranked = dedup_and_rank(docs, self.limit);
        debug!(
            keyword,
            shards = self.shards.len(),
            failed,
            skipped,
            results = ranked.len(),
            duration = fmt_duration(start.elapsed()),
            "search complete"
        );
        Ok(ranked)
    }
}
