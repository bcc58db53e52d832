use anyhow::Result;
use diesel::prelude::*;
use uuid::Uuid;

use crate::races::Race;
use crate::web::PgPool;

#[derive(Clone)]
pub struct RacesRepository {
    pool: PgPool,
}

impl RacesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, race: &Race) -> Result<()> {
        use crate::schema::races::dsl::*;

        let new_race = race.clone();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            diesel::insert_into(races)
                .values(&new_race)
                .execute(&mut conn)?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_by_id(&self, race_id: Uuid) -> Result<Option<Race>> {
        use crate::schema::races::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let race = races
                .filter(id.eq(race_id))
                .first::<Race>(&mut conn)
                .optional()?;
            Ok::<Option<Race>, anyhow::Error>(race)
        })
        .await?
    }

    /// Races whose date range includes today. Fan-out hubs are spun up for
    /// each of these.
    pub async fn get_active(&self) -> Result<Vec<Race>> {
        use crate::schema::races::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let today = chrono::Utc::now().date_naive();
            let active = races
                .filter(date.le(today))
                .filter(end_date.ge(today))
                .order(date.asc())
                .load::<Race>(&mut conn)?;
            Ok::<Vec<Race>, anyhow::Error>(active)
        })
        .await?
    }
}
