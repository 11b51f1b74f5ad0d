//! In-process queue for single-node deployments and tests.

use super::{Delivery, Priority, QueueError, WorkItem, WorkQueue};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
struct Queued {
    item: WorkItem,
    attempt: u32,
    seq: u64,
}

impl Queued {
    fn rank(&self) -> (Priority, std::cmp::Reverse<u64>) {
        (self.item.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: highest priority first, then lowest sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Default)]
struct Inner {
    ready: BinaryHeap<Queued>,
    inflight: HashMap<String, (WorkItem, u32)>,
    next_seq: u64,
}

impl Inner {
    fn push(&mut self, item: WorkItem, attempt: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Queued { item, attempt, seq });
    }
}

/// Counters exposed for health reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    available: Notify,
    next_tag: AtomicU64,
    closed: AtomicBool,
    reject_publishes: AtomicBool,
    published: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every publish fail until reset.
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::Release);
    }

    /// Items waiting for delivery.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliveries neither acked nor nacked yet.
    pub fn inflight(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut inner = self.lock();
        let queued = inner.ready.pop()?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        inner
            .inflight
            .insert(tag.clone(), (queued.item.clone(), queued.attempt));
        Some(Delivery {
            tag,
            item: queued.item,
            attempt: queued.attempt,
        })
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if self.reject_publishes.load(Ordering::Acquire) {
            return Err(QueueError::Publish("broker rejected the message".into()));
        }
        self.lock().push(item.clone(), 1);
        self.published.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        trace!(keyword = item.keyword.as_str(), priority = %item.priority, "published");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock()
            .inflight
            .remove(&delivery.tag)
            .ok_or_else(|| QueueError::Ack(format!("unknown delivery tag {}", delivery.tag)))?;
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let (item, attempt) = inner
            .inflight
            .remove(&delivery.tag)
            .ok_or_else(|| QueueError::Ack(format!("unknown delivery tag {}", delivery.tag)))?;
        if requeue {
            inner.push(item, attempt + 1);
            drop(inner);
            self.requeued.fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}
