use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::tracker_devices;

/// Registration record mapping a physical GPS tracker to a pilot and race.
/// The TCP front-end only admits logins from registered devices; the
/// registration also supplies the pilot/race parts of the composite flight
/// identifier.
#[derive(Debug, Clone, Queryable, Insertable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = tracker_devices)]
pub struct TrackerDevice {
    pub id: Uuid,
    pub device_id: String,
    pub race_uuid: Uuid,
    pub pilot_id: String,
    pub pilot_name: String,
    pub source: String,
    pub registered_at: DateTime<Utc>,
}

impl TrackerDevice {
    pub fn new(
        device_id: String,
        race_uuid: Uuid,
        pilot_id: String,
        pilot_name: String,
        source: crate::flights::FlightSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            race_uuid,
            pilot_id,
            pilot_name,
            source: source.as_str().to_string(),
            registered_at: Utc::now(),
        }
    }
}
