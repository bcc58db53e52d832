use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::schema::races;

/// Immutable race descriptor. Owns many flights.
#[derive(Debug, Clone, Queryable, Insertable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = races)]
pub struct Race {
    pub id: Uuid,
    pub name: String,
    pub date: NaiveDate,
    pub end_date: NaiveDate,
    pub timezone: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Race {
    pub fn new(
        name: String,
        date: NaiveDate,
        end_date: NaiveDate,
        timezone: Option<String>,
        location: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            date,
            end_date,
            timezone,
            location,
            created_at: Utc::now(),
        }
    }

    /// Resolve the race's IANA timezone. Falls back to UTC when the timezone
    /// is missing or unparseable, which is logged once per call site.
    pub fn tz(&self) -> Tz {
        match self.timezone.as_deref() {
            Some(name) => match name.parse::<Tz>() {
                Ok(tz) => tz,
                Err(_) => {
                    warn!(race_id = %self.id, timezone = name, "Unparseable race timezone, using UTC");
                    Tz::UTC
                }
            },
            None => {
                warn!(race_id = %self.id, "Race has no timezone configured, using UTC");
                Tz::UTC
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race_with_tz(tz: Option<&str>) -> Race {
        Race::new(
            "Alps Open".to_string(),
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 8).unwrap(),
            tz.map(|s| s.to_string()),
            Some("Fiesch".to_string()),
        )
    }

    #[test]
    fn test_tz_resolution() {
        assert_eq!(race_with_tz(Some("Europe/Rome")).tz(), chrono_tz::Europe::Rome);
        assert_eq!(race_with_tz(None).tz(), Tz::UTC);
        assert_eq!(race_with_tz(Some("Mars/Olympus")).tz(), Tz::UTC);
    }
}
