//! Durable queue on Redis.
//!
//! Layout for a queue named `q`:
//! - `q:pending`, a sorted set of envelopes scored so that the lowest score is
//!   the highest priority, oldest first;
//! - `q:inflight`, a hash of delivery tag to envelope for unacknowledged deliveries;
//! - `q:signal`, a short list consumers block on to learn about new work.
//!
//! Taking an item moves it from `pending` to `inflight` in one script, so a
//! consumer crash leaves it recoverable with [`RedisQueue::recover_inflight`].

use super::{Delivery, QueueError, WorkItem, WorkQueue};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use redis::Script;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Longest single BLPOP; keeps shutdown and deadline checks responsive.
const SIGNAL_WAIT: Duration = Duration::from_secs(1);

/// Signals beyond this many are redundant wakeups.
const SIGNAL_CAP: isize = 1024;

/// Priority weight in the pending score; larger than any millisecond timestamp.
const PRIORITY_WEIGHT: f64 = 1e13;

const TAKE_SCRIPT: &str = r#"
local items = redis.call('ZRANGE', KEYS[1], 0, 0)
if #items == 0 then
    return false
end
redis.call('ZREM', KEYS[1], items[1])
local ok, envelope = pcall(cjson.decode, items[1])
if not ok or type(envelope) ~= 'table' or type(envelope['tag']) ~= 'string' then
    return {'malformed', items[1]}
end
redis.call('HSET', KEYS[2], envelope['tag'], items[1])
return {'ok', items[1]}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    tag: String,
    item: WorkItem,
    attempt: u32,
}

impl Envelope {
    fn score(&self) -> f64 {
        let rank = f64::from(u8::MAX - self.item.priority.get());
        rank * PRIORITY_WEIGHT + self.item.enqueued_at.timestamp_millis().max(0) as f64
    }

    fn into_delivery(self) -> Delivery {
        Delivery {
            tag: self.tag,
            item: self.item,
            attempt: self.attempt,
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Receive(e.to_string())
    }
}

pub struct RedisQueue {
    name: String,
    pool: Pool,
    timeout: Duration,
    take: Script,
}

impl RedisQueue {
    pub fn open(
        url: &str,
        name: &str,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self, QueueError> {
        let mut config = Config::from_url(url);
        let mut pool_config = PoolConfig::new(pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        config.pool = Some(pool_config);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Receive(format!("queue pool: {e}")))?;

        Ok(Self {
            name: name.to_owned(),
            pool,
            timeout,
            take: Script::new(TAKE_SCRIPT),
        })
    }

    fn key(&self, part: &str) -> String {
        format!("{}:{part}", self.name)
    }

    async fn conn(&self) -> Result<Connection, QueueError> {
        if self.pool.is_closed() {
            return Err(QueueError::Closed);
        }
        tokio::time::timeout(self.timeout, self.pool.get())
            .await
            .map_err(|_| QueueError::Timeout(self.timeout))?
            .map_err(|e| QueueError::Receive(e.to_string()))
    }

    /// Put `envelope` (back) into `pending` and wake one consumer.
    async fn enqueue(&self, envelope: &Envelope, remove_inflight: bool) -> Result<(), QueueError> {
        let body = serde_json::to_string(envelope)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if remove_inflight {
            pipe.hdel(self.key("inflight"), &envelope.tag).ignore();
        }
        pipe.zadd(self.key("pending"), body, envelope.score())
            .ignore()
            .lpush(self.key("signal"), 1)
            .ignore()
            .ltrim(self.key("signal"), 0, SIGNAL_CAP - 1)
            .ignore();

        let mut conn = self.conn().await?;
        tokio::time::timeout(self.timeout, pipe.query_async::<()>(&mut *conn))
            .await
            .map_err(|_| QueueError::Timeout(self.timeout))??;
        Ok(())
    }

    /// Take the head of `pending`, skipping and discarding malformed messages.
    async fn try_take(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;
        loop {
            let taken: Option<(String, String)> = self
                .take
                .key(self.key("pending"))
                .key(self.key("inflight"))
                .invoke_async(&mut *conn)
                .await?;

            let Some((kind, body)) = taken else {
                return Ok(None);
            };
            if kind != "ok" {
                warn!(body = body.as_str(), "dropping malformed queue message");
                continue;
            }
            match serde_json::from_str::<Envelope>(&body) {
                Ok(envelope) => return Ok(Some(envelope.into_delivery())),
                Err(e) => {
                    warn!(error = %e, "dropping malformed queue message");
                    // The script filed it under its tag; remove it so recovery skips it too.
                    let tag = serde_json::from_str::<serde_json::Value>(&body)
                        .ok()
                        .and_then(|v| v.get("tag").and_then(|t| t.as_str()).map(str::to_owned));
                    if let Some(tag) = tag {
                        redis::cmd("HDEL")
                            .arg(self.key("inflight"))
                            .arg(tag)
                            .query_async::<()>(&mut *conn)
                            .await?;
                    }
                }
            }
        }
    }

    /// Requeue every in-flight delivery, returning how many were recovered.
    ///
    /// Meant for startup, before any consumer of this queue is running.
    pub async fn recover_inflight(&self) -> Result<usize, QueueError> {
        let orphans: Vec<(String, String)> = {
            let mut conn = self.conn().await?;
            redis::cmd("HGETALL")
                .arg(self.key("inflight"))
                .query_async(&mut *conn)
                .await?
        };

        let mut recovered = 0;
        for (tag, body) in orphans {
            match serde_json::from_str::<Envelope>(&body) {
                Ok(mut envelope) => {
                    envelope.attempt += 1;
                    self.enqueue(&envelope, true).await?;
                    recovered += 1;
                }
                Err(e) => {
                    warn!(tag = tag.as_str(), error = %e, "discarding malformed in-flight message");
                    let mut conn = self.conn().await?;
                    redis::cmd("HDEL")
                        .arg(self.key("inflight"))
                        .arg(&tag)
                        .query_async::<()>(&mut *conn)
                        .await?;
                }
            }
        }

        if recovered > 0 {
            info!(queue = self.name.as_str(), recovered, "requeued orphaned deliveries");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError> {
        let envelope = Envelope {
            tag: Ulid::new().to_string(),
            item: item.clone(),
            attempt: 1,
        };
        self.enqueue(&envelope, false).await.map_err(|e| match e {
            QueueError::Receive(msg) => QueueError::Publish(msg),
            other => other,
        })?;
        debug!(keyword = item.keyword.as_str(), priority = %item.priority, "published");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take().await? {
                return Ok(Some(delivery));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let block = remaining.min(SIGNAL_WAIT);

            let mut conn = self.conn().await?;
            let mut blpop = redis::cmd("BLPOP");
            blpop.arg(self.key("signal")).arg(block.as_secs_f64());
            let signal = blpop.query_async::<Option<(String, String)>>(&mut *conn);
            tokio::time::timeout(block + self.timeout, signal)
                .await
                .map_err(|_| QueueError::Timeout(block + self.timeout))??;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.key("inflight"))
            .arg(&delivery.tag)
            .query_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;
        if removed == 0 {
            return Err(QueueError::Ack(format!(
                "unknown delivery tag {}",
                delivery.tag
            )));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            let envelope = Envelope {
                tag: delivery.tag.clone(),
                item: delivery.item.clone(),
                attempt: delivery.attempt + 1,
            };
            return self.enqueue(&envelope, true).await.map_err(|e| match e {
                QueueError::Receive(msg) => QueueError::Ack(msg),
                other => other,
            });
        }

        let mut conn = self.conn().await?;
        redis::cmd("HDEL")
            .arg(self.key("inflight"))
            .arg(&delivery.tag)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use chrono::TimeZone;

    fn envelope(priority: u8, millis: i64) -> Envelope {
        Envelope {
            tag: "t".into(),
            item: WorkItem {
                keyword: "k".into(),
                priority: Priority::new(priority),
                enqueued_at: chrono::Utc.timestamp_millis_opt(millis).unwrap(),
            },
            attempt: 1,
        }
    }

    #[test]
    fn elevated_priority_scores_lower() {
        let old_normal = envelope(0, 1_000);
        let new_elevated = envelope(10, 1_700_000_000_000);
        assert!(new_elevated.score() < old_normal.score());
    }

    #[test]
    fn same_priority_orders_by_enqueue_time() {
        assert!(envelope(0, 1_000).score() < envelope(0, 2_000).score());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let body = serde_json::to_string(&envelope(10, 5)).unwrap();
        let parsed: Envelope = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.item.priority, Priority::ELEVATED);
        assert_eq!(parsed.tag, "t");
    }

    #[tokio::test]
    async fn closed_queue_rejects_operations() {
        let queue =
            RedisQueue::open("redis://127.0.0.1:1/0", "q", 2, Duration::from_millis(100)).unwrap();
        queue.close().await;
        assert!(matches!(
            queue.receive(Duration::from_millis(10)).await,
            Err(QueueError::Closed)
        ));
    }
}
