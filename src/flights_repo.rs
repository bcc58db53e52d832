use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::flights::{FixSummary, Flight, FlightSource, FlightState};
use crate::web::PgPool;

#[derive(Clone)]
pub struct FlightsRepository {
    pool: PgPool,
}

impl FlightsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a flight unless one with the same (flight_id, source) already
    /// exists, then return the surviving row. Concurrent creators for the
    /// same tracker flight converge on a single record.
    pub async fn create_if_absent(&self, flight: Flight) -> Result<Flight> {
        use crate::schema::flights::dsl::*;

        let new_flight = flight.clone();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted = diesel::insert_into(flights)
                .values(&new_flight)
                .on_conflict((flight_id, source))
                .do_nothing()
                .execute(&mut conn)?;

            if inserted > 0 {
                metrics::counter!("flights.created").increment(1);
                info!(
                    "Created flight {} (source={}, pilot={})",
                    new_flight.flight_id, new_flight.source, new_flight.pilot_id
                );
                return Ok(new_flight);
            }

            // Lost the race to another creator; fetch the winner.
            let existing = flights
                .filter(flight_id.eq(&new_flight.flight_id))
                .filter(source.eq(&new_flight.source))
                .first::<Flight>(&mut conn)?;
            Ok::<Flight, anyhow::Error>(existing)
        })
        .await?
    }

    pub async fn get_by_uuid(&self, flight_uuid: Uuid) -> Result<Option<Flight>> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let flight = flights
                .filter(id.eq(flight_uuid))
                .first::<Flight>(&mut conn)
                .optional()?;
            Ok::<Option<Flight>, anyhow::Error>(flight)
        })
        .await?
    }

    pub async fn get_by_flight_id(&self, fid: &str) -> Result<Option<Flight>> {
        use crate::schema::flights::dsl::*;

        let fid = fid.to_string();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let flight = flights
                .filter(flight_id.eq(fid))
                .order(created_at.desc())
                .first::<Flight>(&mut conn)
                .optional()?;
            Ok::<Option<Flight>, anyhow::Error>(flight)
        })
        .await?
    }

    /// Which of the given flight ids exist. One round trip per batch; the
    /// validator runs this before any insert attempt.
    pub async fn existing_flight_ids(&self, ids: Vec<String>) -> Result<HashSet<String>> {
        use crate::schema::flights::dsl::*;

        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let found: Vec<String> = flights
                .filter(flight_id.eq_any(&ids))
                .select(flight_id)
                .load(&mut conn)?;
            Ok::<HashSet<String>, anyhow::Error>(found.into_iter().collect())
        })
        .await?
    }

    /// Resolve flight_id -> flight uuid for a batch of ids.
    pub async fn uuids_for_flight_ids(&self, ids: Vec<String>) -> Result<HashMap<String, Uuid>> {
        use crate::schema::flights::dsl::*;

        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let rows: Vec<(String, Uuid)> = flights
                .filter(flight_id.eq_any(&ids))
                .select((flight_id, id))
                .load(&mut conn)?;
            Ok::<HashMap<String, Uuid>, anyhow::Error>(rows.into_iter().collect())
        })
        .await?
    }

    /// Most recent flight for a (device, race) pair. The separator treats
    /// this as the open flight candidate.
    pub async fn open_flight_for_device(
        &self,
        device: &str,
        race: Uuid,
    ) -> Result<Option<Flight>> {
        use crate::schema::flights::dsl::*;

        let device = device.to_string();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let flight = flights
                .filter(device_id.eq(device))
                .filter(race_uuid.eq(race))
                .order(created_at.desc())
                .first::<Flight>(&mut conn)
                .optional()?;
            Ok::<Option<Flight>, anyhow::Error>(flight)
        })
        .await?
    }

    /// Advance a flight's denormalised fix summary after a bulk insert:
    /// first_fix is pinned on the first batch, last_fix and total_points move
    /// on every one. Read-modify-write inside a single transaction so
    /// concurrent writers for the same flight serialize on the row.
    pub async fn apply_batch_summary(
        &self,
        flight_uuid: Uuid,
        batch_first: FixSummary,
        batch_last: FixSummary,
        inserted: usize,
    ) -> Result<()> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let flight = flights
                    .filter(id.eq(flight_uuid))
                    .for_update()
                    .first::<Flight>(conn)?;

                let new_first = match flight.first_fix() {
                    Some(existing) if existing.timestamp <= batch_first.timestamp => existing,
                    _ => batch_first,
                };
                let new_last = match flight.last_fix() {
                    Some(existing) if existing.timestamp >= batch_last.timestamp => existing,
                    _ => batch_last,
                };

                diesel::update(flights.filter(id.eq(flight_uuid)))
                    .set((
                        first_fix.eq(Some(new_first.to_value())),
                        last_fix.eq(Some(new_last.to_value())),
                        total_points.eq(total_points + inserted as i32),
                    ))
                    .execute(conn)?;
                Ok(())
            })?;

            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    pub async fn update_flight_state(&self, flight_uuid: Uuid, state: FlightState) -> Result<()> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            diesel::update(flights.filter(id.eq(flight_uuid)))
                .set(flight_state.eq(Some(state.to_value())))
                .execute(&mut conn)?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    /// Recompute total_points from the live points table. The counter drifts
    /// upward across retention deletes; this is the on-demand correction.
    pub async fn recount_points(&self, flight_uuid: Uuid) -> Result<i64> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            use crate::schema::{flights, live_track_points};
            let mut conn = pool.get()?;

            let count: i64 = live_track_points::table
                .filter(live_track_points::flight_uuid.eq(flight_uuid))
                .count()
                .get_result(&mut conn)?;

            diesel::update(flights::table.filter(flights::id.eq(flight_uuid)))
                .set(flights::total_points.eq(count as i32))
                .execute(&mut conn)?;

            Ok::<i64, anyhow::Error>(count)
        })
        .await?
    }

    /// All non-upload flights, newest first. The live summary endpoint
    /// aggregates these in memory; the live retention window keeps the
    /// working set small.
    pub async fn live_flights(&self) -> Result<Vec<Flight>> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let rows = flights
                .filter(source.ne(FlightSource::Upload.as_str()))
                .order(created_at.desc())
                .load::<Flight>(&mut conn)?;
            Ok::<Vec<Flight>, anyhow::Error>(rows)
        })
        .await?
    }

    pub async fn recent_flights_for_pilot(&self, pilot: &str, limit: i64) -> Result<Vec<Flight>> {
        use crate::schema::flights::dsl::*;

        let pilot = pilot.to_string();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let rows = flights
                .filter(pilot_id.eq(pilot))
                .order(created_at.desc())
                .limit(limit)
                .load::<Flight>(&mut conn)?;
            Ok::<Vec<Flight>, anyhow::Error>(rows)
        })
        .await?
    }

    pub async fn delete_flights_for_pilot(&self, pilot: &str) -> Result<usize> {
        use crate::schema::flights::dsl::*;

        let pilot = pilot.to_string();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let deleted =
                diesel::delete(flights.filter(pilot_id.eq(pilot))).execute(&mut conn)?;
            Ok::<usize, anyhow::Error>(deleted)
        })
        .await?
    }

    pub async fn delete_flight_by_uuid(
        &self,
        flight_uuid: Uuid,
        source_filter: Option<FlightSource>,
    ) -> Result<usize> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let deleted = match source_filter {
                Some(s) => diesel::delete(
                    flights
                        .filter(id.eq(flight_uuid))
                        .filter(source.eq(s.as_str())),
                )
                .execute(&mut conn)?,
                None => {
                    diesel::delete(flights.filter(id.eq(flight_uuid))).execute(&mut conn)?
                }
            };
            Ok::<usize, anyhow::Error>(deleted)
        })
        .await?
    }

    /// Live flights created before the cutoff; candidates for the retention
    /// sweep.
    pub async fn expired_live_flights(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let rows: Vec<(Uuid, String)> = flights
                .filter(source.eq(FlightSource::Live.as_str()))
                .filter(created_at.lt(cutoff))
                .select((id, flight_id))
                .load(&mut conn)?;
            Ok::<Vec<(Uuid, String)>, anyhow::Error>(rows)
        })
        .await?
    }

    pub async fn delete_flights_by_uuids(&self, uuids: Vec<Uuid>) -> Result<usize> {
        use crate::schema::flights::dsl::*;

        if uuids.is_empty() {
            return Ok(0);
        }

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let deleted =
                diesel::delete(flights.filter(id.eq_any(uuids))).execute(&mut conn)?;
            debug!("Retention sweep deleted {} flights", deleted);
            Ok::<usize, anyhow::Error>(deleted)
        })
        .await?
    }
}
