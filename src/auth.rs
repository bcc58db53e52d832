//! Bearer-token verification for the live WebSocket surface.
//!
//! Token issuance lives in the platform's authentication service; this side
//! only verifies the HS256 signature and expiry, and extracts the claims the
//! fan-out hub scopes deliveries by.

use anyhow::{Context, Result, bail};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Claims carried by a live-viewing token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveTokenClaims {
    pub pilot_id: String,
    pub race_id: String,
    #[serde(default)]
    pub pilot_name: Option<String>,
    /// Free-form race metadata minted alongside the token (name, dates).
    #[serde(default)]
    pub race: Option<serde_json::Value>,
    pub exp: i64,
}

pub fn decode_live_token(token: &str, secret: &str) -> Result<LiveTokenClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = decode::<LiveTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("live token rejected")?;

    Ok(data.claims)
}

/// Verify a token against the race a client is connecting to.
pub fn authorize_for_race(token: &str, secret: &str, race_id: &str) -> Result<LiveTokenClaims> {
    let claims = decode_live_token(token, secret)?;
    if claims.race_id != race_id {
        bail!("token is scoped to race {}, not {}", claims.race_id, race_id);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";

    fn mint(race_id: &str, exp_offset: i64) -> String {
        let claims = LiveTokenClaims {
            pilot_id: "p42".to_string(),
            race_id: race_id.to_string(),
            pilot_name: Some("Test Pilot".to_string()),
            race: None,
            exp: chrono::Utc::now().timestamp() + exp_offset,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_round_trip() {
        let token = mint("race-1", 3600);
        let claims = authorize_for_race(&token, SECRET, "race-1").unwrap();
        assert_eq!(claims.pilot_id, "p42");
        assert_eq!(claims.pilot_name.as_deref(), Some("Test Pilot"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = mint("race-1", -3600);
        assert!(decode_live_token(&token, SECRET).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint("race-1", 3600);
        assert!(decode_live_token(&token, "other-secret").is_err());
    }

    #[test]
    fn test_race_scope_enforced() {
        let token = mint("race-1", 3600);
        assert!(authorize_for_race(&token, SECRET, "race-2").is_err());
    }
}
