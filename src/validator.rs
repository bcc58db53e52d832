//! Pre-flight checks run on every batch pulled from a queue, before the
//! writer attempts any insert.
//!
//! Foreign-key misses are permanent (the flight was deleted or never
//! existed), so those items go straight to the DLQ instead of looping
//! through retries. Shape errors are equally unrecoverable.

use anyhow::Result;
use std::collections::HashSet;
use tracing::warn;

use crate::flights_repo::FlightsRepository;
use crate::point_queue::{QueueItem, QueuePoint};

/// Why an item failed validation. Maps one-to-one onto DLQ reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointFault {
    ForeignKeyMissing,
    InvalidShape(String),
}

impl PointFault {
    pub fn dlq_reason(&self) -> &'static str {
        match self {
            PointFault::ForeignKeyMissing => "foreign_key_missing",
            PointFault::InvalidShape(_) => "invalid_shape",
        }
    }
}

/// Shape check for a single point: coordinates on the globe, finite values.
/// Timestamps arrive already parsed (chrono rejects garbage at the serde
/// layer), so only range errors remain.
pub fn check_point_shape(point: &QueuePoint) -> Result<(), String> {
    if !point.lat.is_finite() || !(-90.0..=90.0).contains(&point.lat) {
        return Err(format!("latitude out of range: {}", point.lat));
    }
    if !point.lon.is_finite() || !(-180.0..=180.0).contains(&point.lon) {
        return Err(format!("longitude out of range: {}", point.lon));
    }
    if let Some(elevation) = point.elevation
        && !elevation.is_finite()
    {
        return Err(format!("non-finite elevation: {}", elevation));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Validator {
    flights_repo: FlightsRepository,
}

impl Validator {
    pub fn new(flights_repo: FlightsRepository) -> Self {
        Self { flights_repo }
    }

    /// Split a dequeued batch into items ready for insert and items bound
    /// for the DLQ. The foreign-key existence check is one round trip for
    /// the whole batch. Transient store errors propagate to the caller and
    /// follow the writer's retry policy.
    pub async fn validate_batch(
        &self,
        items: Vec<QueueItem>,
    ) -> Result<(Vec<QueueItem>, Vec<(QueueItem, PointFault)>)> {
        let flight_ids: Vec<String> = items
            .iter()
            .map(|item| item.flight_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let existing = self.flights_repo.existing_flight_ids(flight_ids).await?;

        let mut valid = Vec::with_capacity(items.len());
        let mut faulted = Vec::new();

        for item in items {
            if !existing.contains(&item.flight_id) {
                metrics::counter!("validator.foreign_key_missing").increment(1);
                faulted.push((item, PointFault::ForeignKeyMissing));
                continue;
            }

            let shape_fault = item.points.iter().find_map(|point| {
                check_point_shape(point).err().map(|detail| {
                    warn!(
                        flight_id = %item.flight_id,
                        "Rejecting malformed point batch: {} (sample: lat={} lon={})",
                        detail, point.lat, point.lon
                    );
                    detail
                })
            });

            match shape_fault {
                Some(detail) => {
                    metrics::counter!("validator.invalid_shape").increment(1);
                    faulted.push((item, PointFault::InvalidShape(detail)));
                }
                None => valid.push(item),
            }
        }

        Ok((valid, faulted))
    }
}
