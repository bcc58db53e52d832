use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::trace;
use uuid::Uuid;

use crate::track_points::{NewLivePoint, NewUploadedPoint, PilotPosition, TrackPoint};
use crate::web::PgPool;

#[derive(Clone)]
pub struct TrackPointsRepository {
    pool: PgPool,
}

impl TrackPointsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk insert live points, skipping rows that collide on the
    /// (flight_id, datetime, lat, lon) uniqueness constraint. Returns the
    /// number of rows actually inserted; the difference to the batch size is
    /// the duplicate count.
    pub async fn bulk_insert_live(&self, points: Vec<NewLivePoint>) -> Result<usize> {
        use crate::schema::live_track_points::dsl::*;

        if points.is_empty() {
            return Ok(0);
        }

        let batch_size = points.len();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted = diesel::insert_into(live_track_points)
                .values(&points)
                .on_conflict((flight_id, datetime, lat, lon))
                .do_nothing()
                .execute(&mut conn)?;

            metrics::counter!("points.live.inserted").increment(inserted as u64);
            if inserted < batch_size {
                metrics::counter!("points.live.duplicates")
                    .increment((batch_size - inserted) as u64);
                trace!(
                    "Skipped {} duplicate live points out of {}",
                    batch_size - inserted,
                    batch_size
                );
            }

            Ok::<usize, anyhow::Error>(inserted)
        })
        .await?
    }

    pub async fn bulk_insert_uploaded(&self, points: Vec<NewUploadedPoint>) -> Result<usize> {
        use crate::schema::uploaded_track_points::dsl::*;

        if points.is_empty() {
            return Ok(0);
        }

        let batch_size = points.len();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted = diesel::insert_into(uploaded_track_points)
                .values(&points)
                .on_conflict((flight_id, datetime, lat, lon))
                .do_nothing()
                .execute(&mut conn)?;

            metrics::counter!("points.uploaded.inserted").increment(inserted as u64);
            if inserted < batch_size {
                metrics::counter!("points.uploaded.duplicates")
                    .increment((batch_size - inserted) as u64);
            }

            Ok::<usize, anyhow::Error>(inserted)
        })
        .await?
    }

    pub async fn points_for_flight(
        &self,
        flight: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<TrackPoint>> {
        use crate::schema::live_track_points::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let mut query = live_track_points
                .filter(flight_uuid.eq(flight))
                .order(datetime.asc())
                .into_boxed();
            if let Some(n) = limit {
                query = query.limit(n);
            }
            let rows = query.load::<TrackPoint>(&mut conn)?;
            Ok::<Vec<TrackPoint>, anyhow::Error>(rows)
        })
        .await?
    }

    /// Latest position per pilot for one race, at or before the cutoff. This
    /// is the fan-out tick's read; it runs against the replica pool when one
    /// is configured.
    pub async fn latest_positions_for_race(
        &self,
        race: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PilotPosition>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            use crate::schema::{flights, live_track_points};
            let mut conn = pool.get()?;

            let rows = live_track_points::table
                .inner_join(flights::table)
                .filter(flights::race_uuid.eq(race))
                .filter(live_track_points::datetime.le(cutoff))
                .order((
                    flights::pilot_id.asc(),
                    live_track_points::datetime.desc(),
                ))
                .distinct_on(flights::pilot_id)
                .select((
                    flights::pilot_id,
                    flights::pilot_name,
                    live_track_points::lat,
                    live_track_points::lon,
                    live_track_points::elevation,
                    live_track_points::datetime,
                ))
                .load::<PilotPosition>(&mut conn)?;

            Ok::<Vec<PilotPosition>, anyhow::Error>(rows)
        })
        .await?
    }
}
