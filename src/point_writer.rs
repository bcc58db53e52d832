// Writer pool: one cooperative worker per queue family.
//
// Each loop iteration dequeues a batch, validates it, bulk-inserts the
// survivors with uniqueness conflicts ignored, and advances the owning
// flights' fix summaries. Transient store failures re-enqueue with
// exponential backoff; everything else lands in the DLQ. The store's
// uniqueness constraint makes overlapping batches from concurrent writers
// converge, so no per-flight insert lock is needed.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::flight_tracker::FlightTracker;
use crate::flights::FixSummary;
use crate::flights_repo::FlightsRepository;
use crate::point_queue::{PointQueue, QueueItem};
use crate::queue_config::{
    DEQUEUE_BATCH_SIZE, MAX_POINTS_PER_INSERT, MAX_RETRIES, QueueKind,
    WRITER_BATCH_TIMEOUT_SECS, retry_backoff_secs,
};
use crate::track_points::NewLivePoint;
use crate::track_points_repo::TrackPointsRepository;
use crate::validator::Validator;

/// Shared lease between writers and the retention sweep. Writers hold the
/// read side for the duration of a batch; the sweep takes the write side so
/// deletion never races an in-flight insert.
pub type RetentionGate = Arc<RwLock<()>>;

/// Store errors worth retrying: connection churn, TLS handshakes, timeouts,
/// pool exhaustion. Anything else is treated as permanent.
pub fn is_transient_store_error(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err).to_lowercase();
    [
        "connection reset",
        "connection refused",
        "connection closed",
        "could not connect",
        "broken pipe",
        "tls",
        "handshake",
        "timed out",
        "timeout",
        "pool",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

pub struct PointWriter {
    kind: QueueKind,
    queue: PointQueue,
    validator: Validator,
    flights_repo: FlightsRepository,
    points_repo: TrackPointsRepository,
    flight_tracker: Option<Arc<FlightTracker>>,
    gate: RetentionGate,
    cancel: CancellationToken,
}

impl PointWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: QueueKind,
        queue: PointQueue,
        validator: Validator,
        flights_repo: FlightsRepository,
        points_repo: TrackPointsRepository,
        flight_tracker: Option<Arc<FlightTracker>>,
        gate: RetentionGate,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            queue,
            validator,
            flights_repo,
            points_repo,
            flight_tracker,
            gate,
            cancel,
        }
    }

    /// Worker loop. On shutdown the current batch is finished and committed;
    /// nothing further is dequeued.
    pub async fn run(self) {
        info!("Writer for queue '{}' starting", self.kind);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let (items, remaining) =
                match self.queue.dequeue_batch(self.kind, DEQUEUE_BATCH_SIZE).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("Writer '{}' cannot reach queue: {}", self.kind, e);
                        metrics::counter!(format!("writer.{}.queue_errors", self.kind.name()))
                            .increment(1);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                };

            if items.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                continue;
            }

            debug!(
                "Writer '{}' pulled {} items ({} still pending)",
                self.kind,
                items.len(),
                remaining
            );

            // Hold the retention lease for the whole batch so the sweep
            // cannot delete a flight with an insert in flight.
            let _lease = self.gate.read().await;
            self.process_batch(items).await;
        }

        info!("Writer for queue '{}' drained and stopped", self.kind);
    }

    async fn process_batch(&self, items: Vec<QueueItem>) {
        let (valid, faulted) = match self.validator.validate_batch(items.clone()).await {
            Ok(split) => split,
            Err(e) => {
                // Could not even check foreign keys; store trouble during
                // validation counts as a writer failure, so the whole pull
                // goes through the retry path.
                warn!("Writer '{}' validation failed: {:#}", self.kind, e);
                metrics::counter!(format!("writer.{}.validation_errors", self.kind.name()))
                    .increment(1);
                self.schedule_retries(items, &e.to_string()).await;
                return;
            }
        };

        for (item, fault) in faulted {
            if let Err(e) = self.queue.to_dlq(self.kind, item, fault.dlq_reason()).await {
                error!("Writer '{}' failed to DLQ item: {}", self.kind, e);
            }
        }

        if valid.is_empty() {
            return;
        }

        let persist = tokio::time::timeout(
            Duration::from_secs(WRITER_BATCH_TIMEOUT_SECS),
            self.persist_items(&valid),
        )
        .await;

        match persist {
            Ok(Ok(inserted)) => {
                metrics::counter!(format!("writer.{}.points_written", self.kind.name()))
                    .increment(inserted as u64);
                metrics::counter!(format!("writer.{}.items_committed", self.kind.name()))
                    .increment(valid.len() as u64);
                self.fan_to_scoring(&valid).await;
            }
            Ok(Err(e)) if is_transient_store_error(&e) => {
                warn!(
                    "Writer '{}' transient store failure, scheduling retries: {:#}",
                    self.kind, e
                );
                self.schedule_retries(valid, &e.to_string()).await;
            }
            Ok(Err(e)) => {
                error!("Writer '{}' permanent store failure: {:#}", self.kind, e);
                for mut item in valid {
                    item.last_error = Some(e.to_string());
                    if let Err(dlq_err) =
                        self.queue.to_dlq(self.kind, item, "store_error").await
                    {
                        error!("Writer '{}' failed to DLQ item: {}", self.kind, dlq_err);
                    }
                }
            }
            Err(_elapsed) => {
                warn!(
                    "Writer '{}' batch timed out after {}s, scheduling retries",
                    self.kind, WRITER_BATCH_TIMEOUT_SECS
                );
                self.schedule_retries(valid, "writer batch timeout").await;
            }
        }
    }

    /// Flatten items into point rows per flight and bulk insert, then move
    /// each touched flight's fix summary forward. Returns rows inserted.
    async fn persist_items(&self, items: &[QueueItem]) -> Result<usize> {
        let flight_ids: Vec<String> = items.iter().map(|i| i.flight_id.clone()).collect();
        let uuid_map = self.flights_repo.uuids_for_flight_ids(flight_ids).await?;

        // Per-flight extremes for the summary update.
        let mut summaries: HashMap<String, (FixSummary, FixSummary, usize)> = HashMap::new();
        let mut rows: Vec<NewLivePoint> = Vec::new();

        for item in items {
            let Some(&flight_uuid) = uuid_map.get(&item.flight_id) else {
                // Validated a moment ago but gone now; the next validator
                // pass will DLQ it, so just skip here.
                continue;
            };

            for point in &item.points {
                rows.push(NewLivePoint {
                    flight_id: item.flight_id.clone(),
                    flight_uuid,
                    lat: point.lat,
                    lon: point.lon,
                    elevation: point.elevation,
                    datetime: point.datetime,
                });

                let summary = FixSummary {
                    lat: point.lat,
                    lon: point.lon,
                    elevation: point.elevation,
                    timestamp: point.datetime,
                };
                summaries
                    .entry(item.flight_id.clone())
                    .and_modify(|(first, last, count)| {
                        if summary.timestamp < first.timestamp {
                            *first = summary.clone();
                        }
                        if summary.timestamp >= last.timestamp {
                            *last = summary.clone();
                        }
                        *count += 1;
                    })
                    .or_insert_with(|| (summary.clone(), summary, 1));
            }
        }

        let mut inserted_total = 0;
        for chunk in rows.chunks(MAX_POINTS_PER_INSERT) {
            inserted_total += match self.kind {
                QueueKind::UploadPoints => {
                    self.points_repo
                        .bulk_insert_uploaded(chunk.iter().cloned().map(Into::into).collect())
                        .await?
                }
                _ => self.points_repo.bulk_insert_live(chunk.to_vec()).await?,
            };
        }

        for (flight_id, (first, last, count)) in summaries {
            let Some(&flight_uuid) = uuid_map.get(&flight_id) else {
                continue;
            };
            let last_ts = last.timestamp;
            self.flights_repo
                .apply_batch_summary(flight_uuid, first, last, count)
                .await?;

            // Feedback channel: keep the separator's view of the flight's
            // last fix current so it never reopens a flight the writer has
            // already advanced.
            if let Some(tracker) = &self.flight_tracker {
                tracker.observe_written_fix(&flight_id, last_ts);
            }
        }

        Ok(inserted_total)
    }

    /// After live points commit, hand a copy to the scoring queue. The
    /// scoring service drains that queue on its own schedule; a failed
    /// hand-off is dropped, scoring tolerates gaps.
    async fn fan_to_scoring(&self, items: &[QueueItem]) {
        if self.kind != QueueKind::LivePoints {
            return;
        }
        let scoring: Vec<QueueItem> = items
            .iter()
            .map(|item| {
                QueueItem::new(
                    QueueKind::ScoringPoints,
                    item.flight_id.clone(),
                    item.points.clone(),
                )
            })
            .collect();
        if let Err(e) = self
            .queue
            .enqueue_batch(QueueKind::ScoringPoints, &scoring)
            .await
        {
            debug!("Scoring fan-through skipped: {}", e);
        }
    }

    /// Re-enqueue transiently failed items after their backoff, or park them
    /// in the DLQ once the retry budget is spent. The sleep happens off the
    /// worker loop so the queue keeps draining.
    async fn schedule_retries(&self, items: Vec<QueueItem>, error_msg: &str) {
        for mut item in items {
            let retries = item.retries();
            item.last_error = Some(error_msg.to_string());

            if retries >= MAX_RETRIES {
                metrics::counter!(format!("writer.{}.max_retries", self.kind.name()))
                    .increment(1);
                if let Err(e) = self.queue.to_dlq(self.kind, item, "max_retries").await {
                    error!("Writer '{}' failed to DLQ item: {}", self.kind, e);
                }
                continue;
            }

            item.retry_count = Some(retries + 1);
            let backoff = Duration::from_secs(retry_backoff_secs(retries));
            let queue = self.queue.clone();
            let kind = self.kind;

            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                if let Err(e) = queue.requeue(kind, &item).await {
                    error!("Writer '{}' failed to requeue item: {}", kind, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_store_error(&anyhow::anyhow!(
            "connection reset by peer"
        )));
        assert!(is_transient_store_error(&anyhow::anyhow!(
            "TLS handshake failure"
        )));
        assert!(is_transient_store_error(&anyhow::anyhow!(
            "statement timed out"
        )));
        assert!(is_transient_store_error(&anyhow::anyhow!(
            "connection pool exhausted"
        )));
        assert!(!is_transient_store_error(&anyhow::anyhow!(
            "null value in column \"pilot_id\""
        )));
        assert!(!is_transient_store_error(&anyhow::anyhow!(
            "division by zero"
        )));
    }
}
