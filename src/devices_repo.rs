use anyhow::Result;
use diesel::prelude::*;

use crate::devices::TrackerDevice;
use crate::web::PgPool;

#[derive(Clone)]
pub struct DevicesRepository {
    pool: PgPool,
}

impl DevicesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, device: TrackerDevice) -> Result<()> {
        use crate::schema::tracker_devices::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            diesel::insert_into(tracker_devices)
                .values(&device)
                .on_conflict(device_id)
                .do_update()
                .set((
                    race_uuid.eq(device.race_uuid),
                    pilot_id.eq(&device.pilot_id),
                    pilot_name.eq(&device.pilot_name),
                    source.eq(&device.source),
                ))
                .execute(&mut conn)?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_by_device_id(&self, device: &str) -> Result<Option<TrackerDevice>> {
        use crate::schema::tracker_devices::dsl::*;

        let device = device.to_string();
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let row = tracker_devices
                .filter(device_id.eq(device))
                .first::<TrackerDevice>(&mut conn)
                .optional()?;
            Ok::<Option<TrackerDevice>, anyhow::Error>(row)
        })
        .await?
    }

    pub async fn list(&self) -> Result<Vec<TrackerDevice>> {
        use crate::schema::tracker_devices::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let rows = tracker_devices
                .order(registered_at.desc())
                .load::<TrackerDevice>(&mut conn)?;
            Ok::<Vec<TrackerDevice>, anyhow::Error>(rows)
        })
        .await?
    }
}
