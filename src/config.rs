//! Process configuration, collected once from the environment at startup.
//!
//! Missing required variables are fatal: the process exits non-zero before
//! binding any socket, so a misconfigured deploy fails loudly.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use crate::flight_tracker::LandingConfig;
use crate::live_hub::FanoutConfig;
use crate::tracker_server::GpsServerConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Primary store, used by writers and everything that mutates.
    pub database_url: String,
    /// Optional read replica; the fan-out tier reads here when set.
    pub replica_database_url: Option<String>,
    pub redis_url: String,
    pub jwt_secret: String,

    pub web_interface: String,
    pub web_port: u16,
    pub metrics_port: Option<u16>,

    pub gps_enabled: bool,
    pub gps: GpsServerConfig,

    pub fanout: FanoutConfig,
    pub landing: LandingConfig,

    pub retention_hours: i64,
    pub dlq_max_len: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;

        let replica_database_url = env::var("REPLICA_DATABASE_URL").ok().filter(|s| !s.is_empty());

        let gps = GpsServerConfig {
            port: env_parse("GPS_TCP_PORT", 5002),
            min_message_interval: Duration::from_secs(
                env_parse("GPS_MIN_MESSAGE_INTERVAL_SECS", 2u64).max(2),
            ),
            window_limit: env_parse("GPS_WINDOW_LIMIT", 20),
            reconnect_limit: env_parse("GPS_RECONNECT_LIMIT", 100),
            blacklist_secs: env_parse("GPS_BLACKLIST_SECS", 60),
            ..GpsServerConfig::default()
        };

        let fanout = FanoutConfig {
            delay_seconds: env_parse("BROADCAST_DELAY_SECONDS", 60),
            update_interval_seconds: env_parse("UPDATE_INTERVAL_SECONDS", 10),
        };

        let landing = LandingConfig {
            window_minutes: env_parse("LANDING_WINDOW_MINUTES", 10),
            speed_kmh: env_parse("LANDING_SPEED_KMH", 5.0),
            alt_variation_m: env_parse("LANDING_ALT_VARIATION_M", 10.0),
        };

        Ok(Self {
            database_url,
            replica_database_url,
            redis_url,
            jwt_secret,
            web_interface: env::var("WEB_INTERFACE").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env_parse("WEB_PORT", 8089),
            metrics_port: env::var("METRICS_PORT").ok().and_then(|v| v.parse().ok()),
            gps_enabled: env_bool("GPS_TCP_ENABLED", true),
            gps,
            fanout,
            landing,
            retention_hours: env_parse("RETENTION_HOURS", 48),
            dlq_max_len: env_parse("DLQ_MAX_LEN", 10_000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_missing_database_url_is_fatal() {
        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::set_var("REDIS_URL", "redis://localhost");
            std::env::set_var("JWT_SECRET", "s");
        }
        assert!(Settings::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_defaults() {
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/skylive");
            std::env::set_var("REDIS_URL", "redis://localhost");
            std::env::set_var("JWT_SECRET", "s");
            std::env::remove_var("BROADCAST_DELAY_SECONDS");
            std::env::remove_var("GPS_MIN_MESSAGE_INTERVAL_SECS");
        }
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.fanout.delay_seconds, 60);
        assert_eq!(settings.fanout.update_interval_seconds, 10);
        assert_eq!(settings.retention_hours, 48);
        assert_eq!(settings.gps.min_message_interval, Duration::from_secs(2));
        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("REDIS_URL");
            std::env::remove_var("JWT_SECRET");
        }
    }

    #[test]
    #[serial]
    fn test_message_interval_floor() {
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/skylive");
            std::env::set_var("REDIS_URL", "redis://localhost");
            std::env::set_var("JWT_SECRET", "s");
            std::env::set_var("GPS_MIN_MESSAGE_INTERVAL_SECS", "0");
        }
        let settings = Settings::from_env().unwrap();
        // The floor is two seconds regardless of configuration.
        assert_eq!(settings.gps.min_message_interval, Duration::from_secs(2));
        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("REDIS_URL");
            std::env::remove_var("JWT_SECRET");
            std::env::remove_var("GPS_MIN_MESSAGE_INTERVAL_SECS");
        }
    }
}
