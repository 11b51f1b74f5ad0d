//! Work dispatch queue: priority ordering, manual ack/nack, at-least-once delivery.
//!
//! A delivery stays in flight until it is acked or nacked. Nacking with
//! `requeue` puts the item back with its attempt counter incremented;
//! nacking without it drops the item. Consumers must tolerate redelivery.

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("acknowledgment failed: {0}")]
    Ack(String),
    #[error("malformed queue message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("queue operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("queue is closed")]
    Closed,
}

/// Delivery priority; higher values are delivered first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const NORMAL: Priority = Priority(0);
    pub const ELEVATED: Priority = Priority(10);
    /// Values above this are clamped.
    pub const MAX: Priority = Priority(10);

    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX.0))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub keyword: String,
    #[serde(default)]
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(keyword: impl Into<String>, priority: Priority) -> Self {
        Self {
            keyword: keyword.into(),
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// One delivery of a work item to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Identifies this delivery for ack/nack.
    pub tag: String,
    pub item: WorkItem,
    /// 1 on first delivery, incremented on every requeue.
    pub attempt: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Persist an item for later delivery.
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next delivery. `Ok(None)` means nothing arrived in time.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reject a delivery, putting it back when `requeue` is set.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Stop delivering. Later receives fail with [`QueueError::Closed`].
    async fn close(&self);
}
