use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{live_track_points, uploaded_track_points};

/// Immutable time-series row. Uniqueness is (flight_id, datetime, lat, lon);
/// duplicate inserts are silently absorbed by the store.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = live_track_points)]
pub struct TrackPoint {
    pub id: i64,
    pub flight_id: String,
    pub flight_uuid: Uuid,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = live_track_points)]
pub struct NewLivePoint {
    pub flight_id: String,
    pub flight_uuid: Uuid,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = uploaded_track_points)]
pub struct NewUploadedPoint {
    pub flight_id: String,
    pub flight_uuid: Uuid,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

impl From<NewLivePoint> for NewUploadedPoint {
    fn from(p: NewLivePoint) -> Self {
        Self {
            flight_id: p.flight_id,
            flight_uuid: p.flight_uuid,
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            datetime: p.datetime,
        }
    }
}

/// A pilot's latest delayed position, as read by the fan-out tick.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct PilotPosition {
    pub pilot_id: String,
    pub pilot_name: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}
