// Redis-backed priority queue with per-queue dead letter queues.
//
// Each queue family is a sorted set scored by (priority, enqueue time), so a
// single ZPOPMIN drains strictly by priority and FIFO within a priority.
// Batched enqueues ride one pipelined round trip. Items that cannot be
// processed land in a DLQ list and are never re-enqueued without operator
// action.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::queue_config::{KV_OP_TIMEOUT_SECS, QueueKind};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store is unreachable or timed out. Adapters catch this
    /// and fall back to a direct store write.
    #[error("queue backing store unavailable: {0}")]
    Unavailable(String),

    #[error("queue item serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

/// One position report on the queue wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

/// A unit of work on a queue: one flight's worth of points from a single
/// producer request or tracker frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_type: QueueKind,
    pub flight_id: String,
    pub points: Vec<QueuePoint>,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(queue_type: QueueKind, flight_id: String, points: Vec<QueuePoint>) -> Self {
        let count = points.len();
        Self {
            queue_type,
            flight_id,
            points,
            timestamp: Utc::now(),
            count,
            retry_count: None,
            last_error: None,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }
}

/// DLQ wrapper recording why and when an item was parked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub item: QueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub retries: u32,
}

/// Sorted-set score: strict priority order first, FIFO by enqueue time
/// within a priority.
pub(crate) fn score(priority: i64, enqueue_ms: i64) -> f64 {
    (priority as f64) * 1e12 + enqueue_ms as f64
}

#[derive(Clone)]
pub struct PointQueue {
    conn: ConnectionManager,
}

impl PointQueue {
    /// Connect to Redis. The connection manager multiplexes all queue
    /// traffic over one pipelined connection and reconnects on failure;
    /// more connections are never opened from this handle.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url: {}", e)))?;
        let conn = client.get_connection_manager().await?;
        info!("Connected to queue backing store");
        Ok(Self { conn })
    }

    async fn timed<T, F>(fut: F) -> Result<T, QueueError>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(Duration::from_secs(KV_OP_TIMEOUT_SECS), fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueueError::Unavailable("operation timed out".to_string())),
        }
    }

    /// Append one item. `QueueError::Unavailable` tells the caller to use
    /// the direct-write fallback.
    pub async fn enqueue(&self, kind: QueueKind, item: &QueueItem) -> Result<(), QueueError> {
        let payload = serde_json::to_string(item)?;
        let member_score = score(kind.priority(), item.timestamp.timestamp_millis());
        let mut conn = self.conn.clone();
        let key = kind.key();

        Self::timed(async move {
            conn.zadd::<_, _, _, ()>(key, payload, member_score).await
        })
        .await?;

        metrics::counter!(format!("queue.{}.enqueued", kind.name())).increment(1);
        Ok(())
    }

    /// Enqueue N items in one pipelined round trip. Atomicity is per item:
    /// the returned count is how many were accepted, which can be less than
    /// the batch size.
    pub async fn enqueue_batch(
        &self,
        kind: QueueKind,
        items: &[QueueItem],
    ) -> Result<usize, QueueError> {
        if items.is_empty() {
            return Ok(0);
        }

        let key = kind.key();
        let mut pipe = redis::pipe();
        for item in items {
            let payload = serde_json::to_string(item)?;
            let member_score = score(kind.priority(), item.timestamp.timestamp_millis());
            pipe.zadd(&key, payload, member_score);
        }

        let mut conn = self.conn.clone();
        let results: Vec<i64> =
            Self::timed(async move { pipe.query_async(&mut conn).await }).await?;

        // ZADD reports 0 when an identical member was already queued; those
        // items are merged, not lost.
        let added = results.iter().filter(|&&n| n > 0).count();
        metrics::counter!(format!("queue.{}.enqueued", kind.name())).increment(added as u64);
        if added < items.len() {
            debug!(
                "Queue '{}' merged {}/{} duplicate items in batch",
                kind.name(),
                items.len() - added,
                items.len()
            );
        }
        Ok(added)
    }

    /// Pop up to `max` items in (priority, enqueue-time) order. Returns the
    /// items plus an estimate of what is still pending.
    pub async fn dequeue_batch(
        &self,
        kind: QueueKind,
        max: usize,
    ) -> Result<(Vec<QueueItem>, u64), QueueError> {
        let key = kind.key();
        let mut conn = self.conn.clone();

        let (popped, remaining): (Vec<(String, f64)>, u64) = Self::timed(async move {
            redis::pipe()
                .cmd("ZPOPMIN")
                .arg(&key)
                .arg(max as i64)
                .cmd("ZCARD")
                .arg(&key)
                .query_async(&mut conn)
                .await
        })
        .await?;

        let mut items = Vec::with_capacity(popped.len());
        for (payload, _score) in popped {
            match serde_json::from_str::<QueueItem>(&payload) {
                Ok(item) => items.push(item),
                Err(e) => {
                    // Unknown or corrupt entries go straight to the DLQ so
                    // they do not wedge the queue.
                    warn!("Dropping undecodable queue item on '{}': {}", kind.name(), e);
                    metrics::counter!(format!("queue.{}.undecodable", kind.name()))
                        .increment(1);
                    self.raw_to_dlq(kind, payload, "undecodable_item").await?;
                }
            }
        }

        if !items.is_empty() {
            metrics::counter!(format!("queue.{}.dequeued", kind.name()))
                .increment(items.len() as u64);
        }
        metrics::gauge!(format!("queue.{}.pending", kind.name())).set(remaining as f64);

        Ok((items, remaining))
    }

    /// Put a transiently failed item back, keeping its original enqueue
    /// timestamp so it does not lose its place in the FIFO order.
    pub async fn requeue(&self, kind: QueueKind, item: &QueueItem) -> Result<(), QueueError> {
        let payload = serde_json::to_string(item)?;
        let member_score = score(kind.priority(), item.timestamp.timestamp_millis());
        let mut conn = self.conn.clone();
        let key = kind.key();

        Self::timed(async move {
            conn.zadd::<_, _, _, ()>(key, payload, member_score).await
        })
        .await?;

        metrics::counter!(format!("queue.{}.requeued", kind.name())).increment(1);
        Ok(())
    }

    /// Park an item in the queue's DLQ. Nothing automatic ever reads it
    /// back; operators requeue explicitly via the admin surface.
    pub async fn to_dlq(
        &self,
        kind: QueueKind,
        item: QueueItem,
        reason: &str,
    ) -> Result<(), QueueError> {
        let retries = item.retries();
        let entry = DlqEntry {
            item,
            reason: reason.to_string(),
            failed_at: Utc::now(),
            retries,
        };
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let key = kind.dlq_key();

        Self::timed(async move { conn.rpush::<_, _, ()>(key, payload).await }).await?;

        metrics::counter!(format!("queue.{}.dlq_total", kind.name()), "reason" => reason.to_string())
            .increment(1);
        debug!("Moved item to DLQ '{}': {}", kind.dlq_key(), reason);
        Ok(())
    }

    async fn raw_to_dlq(
        &self,
        kind: QueueKind,
        payload: String,
        reason: &str,
    ) -> Result<(), QueueError> {
        let wrapper = serde_json::json!({
            "item": payload,
            "reason": reason,
            "failed_at": Utc::now(),
            "retries": 0,
        });
        let mut conn = self.conn.clone();
        let key = kind.dlq_key();
        Self::timed(async move {
            conn.rpush::<_, _, ()>(key, wrapper.to_string()).await
        })
        .await?;
        Ok(())
    }

    pub async fn pending(&self, kind: QueueKind) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let key = kind.key();
        Self::timed(async move { conn.zcard(key).await }).await
    }

    pub async fn dlq_size(&self, kind: QueueKind) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let key = kind.dlq_key();
        Self::timed(async move { conn.llen(key).await }).await
    }

    pub async fn dlq_peek(
        &self,
        kind: QueueKind,
        limit: usize,
    ) -> Result<Vec<DlqEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let key = kind.dlq_key();
        let raw: Vec<String> = Self::timed(async move {
            conn.lrange(key, 0, limit as isize - 1).await
        })
        .await?;

        Ok(raw
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect())
    }

    /// Operator action: move up to `max` DLQ entries back onto the queue
    /// with a reset retry count. Returns how many were requeued.
    pub async fn dlq_requeue(&self, kind: QueueKind, max: usize) -> Result<usize, QueueError> {
        let mut requeued = 0;
        for _ in 0..max {
            let mut conn = self.conn.clone();
            let key = kind.dlq_key();
            let popped: Option<String> =
                Self::timed(async move { conn.lpop(key, None).await }).await?;

            let Some(payload) = popped else { break };
            match serde_json::from_str::<DlqEntry>(&payload) {
                Ok(entry) => {
                    let mut item = entry.item;
                    item.retry_count = None;
                    item.last_error = None;
                    self.enqueue(kind, &item).await?;
                    requeued += 1;
                }
                Err(e) => {
                    warn!("Skipping undecodable DLQ entry on '{}': {}", kind.name(), e);
                }
            }
        }
        if requeued > 0 {
            info!("Requeued {} DLQ entries from '{}'", requeued, kind.dlq_key());
        }
        Ok(requeued)
    }

    pub async fn dlq_purge(&self, kind: QueueKind) -> Result<u64, QueueError> {
        let size = self.dlq_size(kind).await?;
        let mut conn = self.conn.clone();
        let key = kind.dlq_key();
        Self::timed(async move { conn.del::<_, ()>(key).await }).await?;
        info!("Purged {} entries from '{}'", size, kind.dlq_key());
        Ok(size)
    }

    /// Reaper entry point: cap a DLQ at `max_len`, dropping the oldest
    /// entries. Returns how many were dropped.
    pub async fn dlq_trim(&self, kind: QueueKind, max_len: u64) -> Result<u64, QueueError> {
        let size = self.dlq_size(kind).await?;
        if size <= max_len {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let key = kind.dlq_key();
        Self::timed(async move {
            conn.ltrim::<_, ()>(key, -(max_len as isize), -1).await
        })
        .await?;

        let dropped = size - max_len;
        warn!(
            "DLQ '{}' trimmed: dropped {} oldest entries (cap {})",
            kind.dlq_key(),
            dropped,
            max_len
        );
        Ok(dropped)
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        Self::timed(async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_orders_by_priority_then_time() {
        let early = 1_700_000_000_000i64;
        let late = early + 5_000;

        // Higher priority (lower number) always pops first, regardless of age.
        assert!(score(1, late) < score(2, early));
        // Within a priority, FIFO by enqueue time.
        assert!(score(2, early) < score(2, late));
        // Scores stay within f64's exact-integer range.
        assert!(score(3, late) < 9_007_199_254_740_992.0);
    }

    #[test]
    fn test_wire_format_fields() {
        let item = QueueItem::new(
            QueueKind::LivePoints,
            "app-abc".to_string(),
            vec![QueuePoint {
                lat: 46.5,
                lon: 8.2,
                elevation: None,
                datetime: Utc::now(),
            }],
        );

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["queue_type"], "live_points");
        assert_eq!(value["flight_id"], "app-abc");
        assert_eq!(value["count"], 1);
        // Optional fields stay off the wire until populated.
        assert!(value.get("retry_count").is_none());
        assert!(value.get("last_error").is_none());
        assert!(value["points"][0].get("elevation").is_none());
    }

    #[test]
    fn test_item_round_trip_with_retries() {
        let mut item = QueueItem::new(QueueKind::UploadPoints, "u-1".to_string(), vec![]);
        item.retry_count = Some(2);
        item.last_error = Some("connection reset by peer".to_string());

        let json = serde_json::to_string(&item).unwrap();
        let back: QueueItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retries(), 2);
        assert_eq!(back.last_error.as_deref(), Some("connection reset by peer"));
        assert_eq!(back.queue_type, QueueKind::UploadPoints);
    }

    #[test]
    fn test_unknown_queue_tag_rejected() {
        let raw = r#"{"queue_type":"mystery_points","flight_id":"x","points":[],"timestamp":"2025-01-01T00:00:00Z","count":0}"#;
        assert!(serde_json::from_str::<QueueItem>(raw).is_err());
    }
}
