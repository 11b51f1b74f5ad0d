use super::entry::{CacheEntry, EntryStatus, RequestHandle, as_pairs};
use super::keys::{QueryKeys, normalize_keyword, request_key};
use super::protocol::{
    CallerTier, PROGRESS_LOADING, PROGRESS_QUEUED, PollOutcome, SubmitOutcome, poll_url,
};
use super::{PollError, SubmitError};
use crate::queue::{QueueError, WorkItem, WorkQueue};
use crate::router::KeyValueRouter;
use crate::store::StoreError;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub cache_ttl: Duration,
    /// Must exceed `publish_timeout` so the claim outlives a slow enqueue.
    pub lock_ttl: Duration,
    pub request_ttl: Duration,
    pub publish_timeout: Duration,
}

/// Decides per query whether to serve the cache, join in-flight work, or start new work.
///
/// The only cross-process mutual exclusion is the store's atomic
/// create-if-absent on the lock key; nothing here serializes callers in-process.
pub struct CacheAsideCoordinator {
    router: Arc<KeyValueRouter>,
    queue: Arc<dyn WorkQueue>,
    settings: CoordinatorSettings,
}

impl CacheAsideCoordinator {
    pub fn new(
        router: Arc<KeyValueRouter>,
        queue: Arc<dyn WorkQueue>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            router,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Submit a query.
    ///
    /// Ready entries are returned directly. Otherwise a request handle is
    /// issued, and if this caller wins the dedup lock the key is marked
    /// loading and exactly one work item is enqueued.
    pub async fn submit(
        &self,
        raw_keyword: &str,
        tier: CallerTier,
    ) -> Result<SubmitOutcome, SubmitError> {
        let keyword = normalize_keyword(raw_keyword).ok_or(SubmitError::InvalidKeyword)?;
        let keys = QueryKeys::for_keyword(keyword);

        let stored = self.router.read().await.hgetall(&keys.cache).await?;
        match CacheEntry::from_fields(&stored) {
            Some(entry) if entry.status == EntryStatus::Ready => match entry.payload_json() {
                Ok(payload) => {
                    debug!(keyword, "cache hit");
                    return Ok(SubmitOutcome::Ready { payload });
                }
                Err(e) => {
                    warn!(keyword, error = %e, "malformed cached payload, recomputing");
                }
            },
            Some(entry) if entry.status == EntryStatus::Loading => {
                debug!(keyword, "query already loading, joining");
                return self.issue_handle(keyword, &keys, false).await;
            }
            _ => {}
        }

        let enqueued = self.claim_and_enqueue(keyword, &keys, tier).await?;
        self.issue_handle(keyword, &keys, enqueued).await
    }

    /// Take the dedup lock and, if won, mark the key loading and enqueue one job.
    ///
    /// Returns whether this call enqueued. The lock is never released
    /// explicitly; it expires after `lock_ttl`.
    async fn claim_and_enqueue(
        &self,
        keyword: &str,
        keys: &QueryKeys,
        tier: CallerTier,
    ) -> Result<bool, SubmitError> {
        let primary = self.router.write().await;
        let owner = Ulid::new().to_string();
        if !primary
            .set_nx(&keys.lock, &owner, self.settings.lock_ttl)
            .await?
        {
            debug!(keyword, "dedup lock held elsewhere, not enqueueing");
            return Ok(false);
        }

        // Loading must be visible before any worker can see the item.
        let loading = CacheEntry::loading_fields(keyword, Utc::now());
        primary
            .hset(&keys.cache, &as_pairs(&loading), Some(self.settings.cache_ttl))
            .await?;

        let item = WorkItem::new(keyword, tier.priority());
        let published = tokio::time::timeout(self.settings.publish_timeout, self.queue.publish(&item))
            .await
            .unwrap_or(Err(QueueError::Timeout(self.settings.publish_timeout)));
        if let Err(e) = published {
            warn!(keyword, error = %e, "enqueue failed after taking the dedup lock");
            // Nobody will finish this entry; mark it failed so the next claim
            // after `lock_ttl` can start fresh work instead of joining it.
            let failed =
                CacheEntry::failed_fields(&format!("dispatch failed, retry: {e}"), Utc::now());
            if let Err(store_err) = primary
                .hset(&keys.cache, &as_pairs(&failed), Some(self.settings.cache_ttl))
                .await
            {
                warn!(keyword, error = %store_err, "failed to mark undispatched entry");
            }
            return Err(SubmitError::Retryable(e));
        }

        info!(keyword, priority = %item.priority, "query enqueued");
        Ok(true)
    }

    async fn issue_handle(
        &self,
        keyword: &str,
        keys: &QueryKeys,
        enqueued: bool,
    ) -> Result<SubmitOutcome, SubmitError> {
        let req_id = Ulid::new().to_string();
        let handle = RequestHandle::new(req_id.clone(), keyword, &keys.cache, Utc::now());
        self.router
            .write()
            .await
            .hset(
                &request_key(&req_id),
                &as_pairs(&handle.to_fields()),
                Some(self.settings.request_ttl),
            )
            .await?;

        Ok(SubmitOutcome::Pending {
            poll_url: poll_url(&req_id),
            req_id,
            enqueued,
        })
    }

    /// Resolve a request handle to the current state of its cache entry.
    ///
    /// Anything a replica reports as missing or unfinished is confirmed on the
    /// primary, so a handle is visible right after submit and a poller never
    /// sees an entry move backwards because of replication lag.
    pub async fn poll(&self, req_id: &str) -> Result<PollOutcome, PollError> {
        if Ulid::from_string(req_id).is_err() {
            return Err(PollError::InvalidRequestId);
        }

        let route = self.router.read().await;
        let key = request_key(req_id);
        let mut stored = route.hgetall(&key).await?;
        if stored.is_empty() && !route.is_fallback() {
            stored = self.router.write().await.hgetall(&key).await?;
        }
        let Some(handle) = RequestHandle::from_fields(req_id, &stored) else {
            return Ok(PollOutcome::NotFound);
        };

        let mut entry = CacheEntry::from_fields(&route.hgetall(&handle.cache_key).await?);
        if !entry.as_ref().is_some_and(|e| e.status.is_terminal()) && !route.is_fallback() {
            entry = CacheEntry::from_fields(&self.primary_hash(&handle.cache_key).await?);
        }

        Ok(match entry {
            None => PollOutcome::Pending {
                progress: PROGRESS_QUEUED,
            },
            Some(entry) => match entry.status {
                EntryStatus::Loading => PollOutcome::Loading {
                    progress: PROGRESS_LOADING,
                },
                EntryStatus::Failed => PollOutcome::Failed {
                    error: entry.error.unwrap_or_else(|| "search failed".to_owned()),
                },
                EntryStatus::Ready => match entry.payload_json() {
                    Ok(payload) => PollOutcome::Ready { payload },
                    // A recompute is due; never report less than the loading it replaces.
                    Err(e) => {
                        warn!(req_id, error = %e, "malformed cached payload");
                        PollOutcome::Loading {
                            progress: PROGRESS_LOADING,
                        }
                    }
                },
            },
        })
    }

    async fn primary_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.router.write().await.hgetall(key).await
    }
}
