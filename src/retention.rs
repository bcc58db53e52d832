// Background sweeps: live-flight retention and the DLQ reaper.
//
// Retention deletes live-sourced flights a fixed number of hours after
// creation; the store cascades their points away. The sweep takes the write
// side of the retention gate, so it only runs between writer batches and
// never races an insert for a flight it is deleting.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::flights_repo::FlightsRepository;
use crate::point_queue::PointQueue;
use crate::point_writer::RetentionGate;
use crate::queue_config::ALL_QUEUES;

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

pub struct RetentionSweeper {
    flights_repo: FlightsRepository,
    gate: RetentionGate,
    retention_hours: i64,
    cancel: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        flights_repo: FlightsRepository,
        gate: RetentionGate,
        retention_hours: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            flights_repo,
            gate,
            retention_hours,
            cancel,
        }
    }

    pub async fn run(self) {
        info!(
            "Retention sweeper started ({}h live flight retention)",
            self.retention_hours
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                warn!("Retention sweep failed: {:#}", e);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
        }

        info!("Retention sweeper stopped");
    }

    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(self.retention_hours);
        let expired = self.flights_repo.expired_live_flights(cutoff).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        info!(
            "Retention sweep: {} live flights older than {}",
            expired.len(),
            cutoff
        );

        // Wait for writers to drain in-flight batches before deleting; new
        // batches queue up behind the write lease.
        let _gate = self.gate.write().await;
        let uuids = expired.into_iter().map(|(uuid, _)| uuid).collect();
        let deleted = self.flights_repo.delete_flights_by_uuids(uuids).await?;
        metrics::counter!("retention.flights_deleted").increment(deleted as u64);
        Ok(deleted)
    }
}

/// Daily cap enforcement on the DLQs; nothing is requeued, only dropped
/// past the cap, and every drop is logged.
pub async fn dlq_reaper(queue: PointQueue, max_len: u64, cancel: CancellationToken) {
    info!("DLQ reaper started (cap {} per queue)", max_len);

    loop {
        for kind in ALL_QUEUES {
            match queue.dlq_trim(kind, max_len).await {
                Ok(0) => {}
                Ok(dropped) => {
                    metrics::counter!(format!("queue.{}.dlq_reaped", kind.name()))
                        .increment(dropped);
                }
                Err(e) => warn!("DLQ reap failed for '{}': {}", kind.name(), e),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }
    }

    info!("DLQ reaper stopped");
}
