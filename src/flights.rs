use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::flights;

/// Where a flight's points come from. Stored as text in the `flights.source`
/// column; part of the composite flight identifier for tracker sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightSource {
    Live,
    Upload,
    Tk905bLive,
    FlymasterLive,
}

impl FlightSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightSource::Live => "live",
            FlightSource::Upload => "upload",
            FlightSource::Tk905bLive => "tk905b_live",
            FlightSource::FlymasterLive => "flymaster_live",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(FlightSource::Live),
            "upload" => Some(FlightSource::Upload),
            "tk905b_live" => Some(FlightSource::Tk905bLive),
            "flymaster_live" => Some(FlightSource::FlymasterLive),
            _ => None,
        }
    }

    /// Tracker sources run through automatic flight separation; mobile and
    /// upload sources supply their own opaque flight identifiers.
    pub fn is_tracker(&self) -> bool {
        matches!(self, FlightSource::Tk905bLive | FlightSource::FlymasterLive)
    }
}

impl std::fmt::Display for FlightSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalised first/last point summary kept on the flight row (jsonb).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSummary {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl FixSummary {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("FixSummary serializes")
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Landing-detection state carried on the flight row (jsonb) so a restart
/// does not forget a landing in progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightState {
    /// Timestamp of the first point of the current on-ground window.
    pub window_start: Option<DateTime<Utc>>,
    /// Elevation envelope observed inside the window.
    pub window_min_elevation: Option<f64>,
    pub window_max_elevation: Option<f64>,
    /// Set once the window has closed: the landing instant (touchdown).
    pub landed_at: Option<DateTime<Utc>>,
}

impl FlightState {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("FlightState serializes")
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// One continuous flying session of one pilot with one producer.
#[derive(Debug, Clone, Queryable, Insertable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = flights)]
pub struct Flight {
    pub id: Uuid,
    pub flight_id: String,
    pub race_uuid: Uuid,
    pub pilot_id: String,
    pub pilot_name: String,
    pub source: String,
    pub device_id: Option<String>,
    pub first_fix: Option<serde_json::Value>,
    pub last_fix: Option<serde_json::Value>,
    pub total_points: i32,
    pub flight_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Flight {
    pub fn new(
        flight_id: String,
        race_uuid: Uuid,
        pilot_id: String,
        pilot_name: String,
        source: FlightSource,
        device_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flight_id,
            race_uuid,
            pilot_id,
            pilot_name,
            source: source.as_str().to_string(),
            device_id,
            first_fix: None,
            last_fix: None,
            total_points: 0,
            flight_state: None,
            created_at: Utc::now(),
        }
    }

    pub fn source(&self) -> Option<FlightSource> {
        FlightSource::parse(&self.source)
    }

    pub fn first_fix(&self) -> Option<FixSummary> {
        self.first_fix.as_ref().and_then(FixSummary::from_value)
    }

    pub fn last_fix(&self) -> Option<FixSummary> {
        self.last_fix.as_ref().and_then(FixSummary::from_value)
    }

    pub fn flight_state(&self) -> FlightState {
        self.flight_state
            .as_ref()
            .map(FlightState::from_value)
            .unwrap_or_default()
    }

    /// Flight duration derived from the fix summaries.
    pub fn duration_seconds(&self) -> Option<i64> {
        let first = self.first_fix()?;
        let last = self.last_fix()?;
        Some((last.timestamp - first.timestamp).num_seconds())
    }
}

/// Build the composite identifier for a tracker flight:
/// `{source}-{pilot_id}-{race_id}-{device_id}[-{suffix}]`.
pub fn tracker_flight_id(
    source: FlightSource,
    pilot_id: &str,
    race_uuid: Uuid,
    device_id: &str,
    suffix: Option<&str>,
) -> String {
    match suffix {
        Some(s) => format!("{}-{}-{}-{}-{}", source, pilot_id, race_uuid, device_id, s),
        None => format!("{}-{}-{}-{}", source, pilot_id, race_uuid, device_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trip() {
        for source in [
            FlightSource::Live,
            FlightSource::Upload,
            FlightSource::Tk905bLive,
            FlightSource::FlymasterLive,
        ] {
            assert_eq!(FlightSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(FlightSource::parse("carrier_pigeon"), None);
    }

    #[test]
    fn test_tracker_sources() {
        assert!(FlightSource::Tk905bLive.is_tracker());
        assert!(FlightSource::FlymasterLive.is_tracker());
        assert!(!FlightSource::Live.is_tracker());
        assert!(!FlightSource::Upload.is_tracker());
    }

    #[test]
    fn test_tracker_flight_id_format() {
        let race = Uuid::nil();
        let id = tracker_flight_id(
            FlightSource::Tk905bLive,
            "p42",
            race,
            "8800001234",
            Some("20250601"),
        );
        assert_eq!(
            id,
            format!("tk905b_live-p42-{}-8800001234-20250601", race)
        );

        let bare = tracker_flight_id(FlightSource::FlymasterLive, "p42", race, "fm1", None);
        assert!(!bare.ends_with('-'));
    }

    #[test]
    fn test_duration_from_summaries() {
        let mut flight = Flight::new(
            "app-abc".to_string(),
            Uuid::new_v4(),
            "p1".to_string(),
            "Pilot One".to_string(),
            FlightSource::Live,
            None,
        );
        assert_eq!(flight.duration_seconds(), None);

        let start = Utc::now();
        flight.first_fix = Some(
            FixSummary {
                lat: 46.0,
                lon: 8.0,
                elevation: Some(2100.0),
                timestamp: start,
            }
            .to_value(),
        );
        flight.last_fix = Some(
            FixSummary {
                lat: 46.1,
                lon: 8.1,
                elevation: Some(900.0),
                timestamp: start + chrono::Duration::minutes(90),
            }
            .to_value(),
        );
        assert_eq!(flight.duration_seconds(), Some(5400));
    }
}
