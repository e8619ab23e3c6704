//! Shared JWT authentication utilities.
//!
//! The hand-off token claims and codec live here so both `meridian-api` and
//! `meridian-gateway` can share them without a circular dependency. HMAC
//! request-signing and the dual auth decorator are API-specific and live in
//! `meridian-api::middleware`.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims embedded in a short-lived signed hand-off token. Used to carry an
/// authenticated identity from an embedded browser (Custom Tab) flow into a
/// native app for exchange into a long-lived HMAC session.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HandoffClaims {
    pub user_id: Uuid,
    pub email: String,
    pub credential_id: Option<String>,
    pub state: Option<String>,
    /// One-shot token identifier; blacklisted after redemption.
    pub jti: Uuid,
    /// Expiration (Unix seconds).
    pub exp: i64,
}

pub fn encode_handoff_token(claims: &HandoffClaims, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn decode_handoff_token(token: &str, secret: &str) -> Result<HandoffClaims, jsonwebtoken::errors::Error> {
    let data = decode::<HandoffClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn round_trips_handoff_claims() {
        let claims = HandoffClaims {
            user_id: Uuid::new_v4(),
            email: "a@x.org".into(),
            credential_id: Some("cred-1".into()),
            state: None,
            jti: Uuid::new_v4(),
            exp: (Utc::now().timestamp()) + 60,
        };
        let token = encode_handoff_token(&claims, "secret").unwrap();
        let decoded = decode_handoff_token(&token, "secret").unwrap();
        assert_eq!(decoded.user_id, claims.user_id);
        assert_eq!(decoded.jti, claims.jti);
    }

    #[test]
    fn rejects_wrong_secret() {
        let claims = HandoffClaims {
            user_id: Uuid::new_v4(),
            email: "a@x.org".into(),
            credential_id: None,
            state: None,
            jti: Uuid::new_v4(),
            exp: Utc::now().timestamp() + 60,
        };
        let token = encode_handoff_token(&claims, "secret").unwrap();
        assert!(decode_handoff_token(&token, "other-secret").is_err());
    }
}
