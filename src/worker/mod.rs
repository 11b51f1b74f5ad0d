//! Bounded pool consuming the dispatch queue.
//!
//! A permit from the admission gate is taken *before* receiving, so a
//! saturated pool leaves deliveries in the queue. Each job runs in its own
//! task under a supervisor: a panic becomes a requeueing nack instead of
//! taking the pool down, and a delivery is acked only after its result is
//! persisted.

use crate::query::entry::{CacheEntry, Fields, as_pairs};
use crate::query::{EntryStatus, QueryKeys};
use crate::queue::{Delivery, QueueError, WorkQueue};
use crate::router::KeyValueRouter;
use crate::search::{SearchBackend, SearchError};
use crate::store::StoreError;
use crate::utils::{fmt_duration, log_if_slow};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Deliveries beyond this many attempts are recorded as failed and dropped.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// How long one receive waits before re-checking for shutdown.
const RECEIVE_WINDOW: Duration = Duration::from_secs(1);

/// Pause after a queue error before receiving again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub search_timeout: Duration,
    pub cache_ttl: Duration,
    pub shutdown_timeout: Duration,
}

pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    router: Arc<KeyValueRouter>,
    search: Arc<dyn SearchBackend>,
    settings: WorkerSettings,
    gate: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        router: Arc<KeyValueRouter>,
        search: Arc<dyn SearchBackend>,
        settings: WorkerSettings,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            queue,
            router,
            search,
            settings: WorkerSettings {
                concurrency,
                ..settings
            },
            gate: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Jobs currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.settings.concurrency - self.gate.available_permits()
    }

    /// Consume until shutdown, then wait (bounded) for in-flight jobs.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(concurrency = self.settings.concurrency, "worker pool started");

        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = self.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = shutdown_rx.recv() => break,
                received = self.queue.receive(RECEIVE_WINDOW) => match received {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(QueueError::Closed) => {
                        info!("queue closed, worker pool stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to receive from queue, backing off");
                        tokio::time::sleep(RECEIVE_BACKOFF).await;
                        continue;
                    }
                },
            };

            let pool = self.clone();
            tokio::spawn(async move {
                pool.supervise(delivery).await;
                drop(permit);
            });
        }

        self.drain().await;
    }

    async fn drain(&self) {
        let in_flight = self.in_flight();
        if in_flight == 0 {
            info!("worker pool stopped");
            return;
        }

        info!(in_flight, "waiting for in-flight jobs");
        let all = u32::try_from(self.settings.concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.settings.shutdown_timeout, self.gate.acquire_many(all)).await
        {
            Ok(_) => info!("worker pool drained"),
            Err(_) => warn!(
                in_flight = self.in_flight(),
                timeout = fmt_duration(self.settings.shutdown_timeout),
                "in-flight jobs did not finish in time, abandoning them"
            ),
        }
    }

    /// Run one delivery to completion and settle it with the queue.
    pub async fn supervise(self: &Arc<Self>, delivery: Delivery) {
        let keyword = delivery.item.keyword.clone();
        let job = tokio::spawn({
            let pool = self.clone();
            let keyword = keyword.clone();
            async move { pool.process(&keyword).await }
        });

        let failure = match job.await {
            Ok(Ok(status)) => {
                if let Err(e) = self.queue.ack(&delivery).await {
                    warn!(keyword = keyword.as_str(), error = %e, "failed to ack completed job");
                } else {
                    debug!(keyword = keyword.as_str(), %status, "job acknowledged");
                }
                return;
            }
            Ok(Err(e)) => format!("cache write failed: {e}"),
            Err(join) if join.is_panic() => {
                error!(keyword = keyword.as_str(), "search job panicked");
                "search job panicked".to_owned()
            }
            Err(join) => format!("search job aborted: {join}"),
        };

        let requeue = delivery.attempt < MAX_DELIVERY_ATTEMPTS;
        if requeue {
            warn!(
                keyword = keyword.as_str(),
                attempt = delivery.attempt,
                reason = failure.as_str(),
                "job failed, requeueing"
            );
        } else {
            error!(
                keyword = keyword.as_str(),
                attempt = delivery.attempt,
                reason = failure.as_str(),
                "job failed too many times, giving up"
            );
            let message = format!("gave up after {} attempts: {failure}", delivery.attempt);
            if let Err(e) = self.persist(&keyword, CacheEntry::failed_fields(&message, Utc::now())).await {
                warn!(keyword = keyword.as_str(), error = %e, "failed to record job failure");
            }
        }

        if let Err(e) = self.queue.nack(&delivery, requeue).await {
            warn!(keyword = keyword.as_str(), error = %e, "failed to nack job");
        }
    }

    /// Search and persist the terminal status. Only a failed cache write is an error.
    async fn process(&self, keyword: &str) -> Result<EntryStatus, StoreError> {
        let keys = QueryKeys::for_keyword(keyword);
        let span = info_span!("search_job", keyword, cache_key = keys.cache.as_str());

        async move {
            let start = Instant::now();
            let result = tokio::time::timeout(self.settings.search_timeout, self.search.search(keyword))
                .await
                .unwrap_or(Err(SearchError::Timeout(self.settings.search_timeout)));

            let (status, fields) = match result {
                Ok(docs) => match serde_json::to_string(&docs) {
                    Ok(payload) => {
                        info!(
                            results = docs.len(),
                            duration = fmt_duration(start.elapsed()),
                            "search succeeded"
                        );
                        (EntryStatus::Ready, CacheEntry::ready_fields(&payload, Utc::now()))
                    }
                    Err(e) => (
                        EntryStatus::Failed,
                        CacheEntry::failed_fields(&format!("result encoding failed: {e}"), Utc::now()),
                    ),
                },
                Err(e) => {
                    warn!(error = %e, "search failed");
                    (EntryStatus::Failed, CacheEntry::failed_fields(&e.to_string(), Utc::now()))
                }
            };

            self.persist_to(&keys, fields).await?;
            log_if_slow(start, SLOW_JOB_THRESHOLD, "search job");
            Ok(status)
        }
        .instrument(span)
        .await
    }

    async fn persist(&self, keyword: &str, fields: Fields) -> Result<(), StoreError> {
        self.persist_to(&QueryKeys::for_keyword(keyword), fields).await
    }

    async fn persist_to(&self, keys: &QueryKeys, fields: Fields) -> Result<(), StoreError> {
        self.router
            .write()
            .await
            .hset(&keys.cache, &as_pairs(&fields), Some(self.settings.cache_ttl))
            .await
    }
}
