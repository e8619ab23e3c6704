//! Authentication service layer (C3) — registration state machine, OTP,
//! WebAuthn passkeys, backup codes, hand-off tokens, and the HMAC/refresh
//! token exchange. No password login path exists anywhere in this design.
//!
//! Every public function here is storage-agnostic glue: it takes a
//! `&rusqlite::Connection` or `&MemoryStore` directly and is called from
//! `routes::auth` inside a `Storage::db.write`/`Storage::db.read` closure.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::admin::RegistrationMode;
use rand::Rng;
use sha2::Sha256;
use std::sync::OnceLock;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use meridian_storage::repository;

type HmacSha256 = Hmac<Sha256>;

static WEBAUTHN: OnceLock<Webauthn> = OnceLock::new();

/// Build (once) the `Webauthn` ceremony engine from the server's configured
/// domain. `domain` is both the RP-ID and the canonical HTTPS origin; the
/// configured `dev_origins` (e.g. `http://localhost:5173`) and the Android
/// APK key-hash origin are accepted alongside it so the same passkeys work
/// from a web client, a dev server, and the native Android app's Custom Tab.
pub fn webauthn() -> &'static Webauthn {
    WEBAUTHN.get_or_init(|| {
        let config = meridian_common::config::get();
        let rp_origin = Url::parse(&format!("https://{}", config.server.domain))
            .expect("configured domain must parse as a URL host");
        let mut builder = WebauthnBuilder::new(&config.server.domain, &rp_origin)
            .expect("rp_id/rp_origin must be consistent");
        for origin in &config.server.dev_origins {
            if let Ok(url) = Url::parse(origin) {
                builder = builder.append_allowed_origin(&url);
            }
        }
        // Android passkeys created from a Trusted Web Activity / Custom Tab
        // report `clientDataJSON.origin` as the literal `android:apk-key-hash:<hash>`.
        // `android:` is a non-special scheme so `Url::parse` accepts it as-is;
        // each configured hash is appended as its own allowed origin.
        for origin in &config.server.android_apk_key_hash_origins {
            if let Ok(url) = Url::parse(origin) {
                builder = builder.append_allowed_origin(&url);
            } else {
                tracing::warn!(origin = %origin, "skipping malformed android_apk_key_hash_origins entry");
            }
        }
        builder.rp_name(&config.server.domain).build().expect("valid webauthn configuration")
    })
}

// ============================================================
// OTP
// ============================================================

/// A fresh 5-digit OTP. Leading zeros are kept (`"00427"` is valid) since the
/// value is always compared as a string, never parsed as a number.
pub fn generate_otp() -> String {
    let mut rng = rand::thread_rng();
    format!("{:05}", rng.gen_range(0..100_000))
}

// ============================================================
// Backup codes
// ============================================================

const BACKUP_CODE_LEN: usize = 10;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate `count` fresh plaintext backup codes (shown to the user exactly
/// once) alongside their bcrypt hashes (what's actually stored).
pub fn generate_backup_codes(count: usize) -> RelayResult<(Vec<String>, Vec<String>)> {
    let mut rng = rand::thread_rng();
    let mut plain = Vec::with_capacity(count);
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        let code: String = (0..BACKUP_CODE_LEN)
            .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())] as char)
            .collect();
        let hashed = hash(&code, DEFAULT_COST).map_err(|e| RelayError::internal(format!("hashing backup code: {e}")))?;
        plain.push(code);
        hashes.push(hashed);
    }
    Ok((plain, hashes))
}

/// Verify `code` against a user's stored backup-code hashes. Returns the
/// matching hash (so the caller can mark it used) or `None`.
pub fn verify_backup_code(code: &str, codes: &[meridian_common::models::user::BackupCode]) -> Option<String> {
    codes
        .iter()
        .filter(|c| !c.used)
        .find(|c| verify(code, &c.hash).unwrap_or(false))
        .map(|c| c.hash.clone())
}

/// True once fewer than `floor` of the original `count` codes remain unused —
/// the point at which `/backupcode/regenerate` becomes necessary.
pub fn backup_codes_need_regeneration(codes: &[meridian_common::models::user::BackupCode], floor: i64) -> bool {
    let remaining = codes.iter().filter(|c| !c.used).count() as i64;
    remaining < floor
}

// ============================================================
// Registration-mode gate
// ============================================================

/// Enforce the server's configured registration mode before an OTP is
/// issued. `invitation_token` is required and consumed under
/// `invitation_only`; ignored otherwise.
pub fn check_registration_mode(
    conn: &rusqlite::Connection,
    email: &str,
    invitation_token: Option<&str>,
) -> RelayResult<()> {
    let settings = repository::admin::get_settings(conn)?;
    match settings.registration_mode {
        RegistrationMode::Open => Ok(()),
        RegistrationMode::EmailSuffix => {
            let allowed = settings.allowed_email_suffixes.iter().any(|suffix| email.ends_with(suffix.as_str()));
            if allowed {
                Ok(())
            } else {
                Err(RelayError::permission_denied("email domain is not allowed to register"))
            }
        }
        RegistrationMode::InvitationOnly => {
            let token = invitation_token.ok_or_else(|| RelayError::validation("an invitation token is required"))?;
            if repository::admin::invitation_is_valid(conn, email, token, Utc::now())? {
                Ok(())
            } else {
                Err(RelayError::permission_denied("invalid or already-used invitation"))
            }
        }
    }
}

// ============================================================
// Hand-off tokens (Custom Tab -> native app)
// ============================================================

/// Mint a short-lived hand-off token carrying `user_id`/`email` from an
/// embedded browser flow to the native app, optionally echoing back the
/// caller's CSRF `state` value.
pub fn mint_handoff_token(
    user_id: Uuid,
    email: &str,
    credential_id: Option<String>,
    state: Option<String>,
) -> RelayResult<String> {
    let config = meridian_common::config::get();
    let claims = meridian_common::auth::HandoffClaims {
        user_id,
        email: email.to_string(),
        credential_id,
        state,
        jti: Uuid::new_v4(),
        exp: (Utc::now() + Duration::seconds(config.auth.handoff_token_ttl_secs)).timestamp(),
    };
    meridian_common::auth::encode_handoff_token(&claims, &config.auth.jwt_secret)
        .map_err(|e| RelayError::internal(format!("minting hand-off token: {e}")))
}

/// Redeem a hand-off token: decode, reject if expired or already
/// blacklisted, then blacklist its `jti` so a second redemption fails.
pub fn redeem_handoff_token(
    conn: &rusqlite::Connection,
    token: &str,
) -> RelayResult<meridian_common::auth::HandoffClaims> {
    let config = meridian_common::config::get();
    let claims = meridian_common::auth::decode_handoff_token(token, &config.auth.jwt_secret)
        .map_err(|_| RelayError::auth_invalid("invalid or expired hand-off token"))?;

    if repository::auth_tokens::is_blacklisted(conn, &claims.jti.to_string())? {
        return Err(RelayError::auth_invalid("hand-off token already redeemed"));
    }
    let exp = DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);
    repository::auth_tokens::blacklist_jti(conn, &claims.jti.to_string(), exp)?;
    Ok(claims)
}

// ============================================================
// Magic link
// ============================================================

/// `serverUrl|randomHash|timestamp|hmac(serverUrl|randomHash|timestamp)` —
/// a self-verifying link that doesn't require a server-side lookup to
/// validate its *signature*, though the random hash is still checked against
/// the one-shot [`meridian_storage::memory::MagicLinkEntry`] to enforce
/// single use and server-side revocation.
pub fn build_magic_link(server_url: &str, random_hash: &str, timestamp: i64, secret: &str) -> String {
    let canonical = format!("{server_url}|{random_hash}|{timestamp}");
    let sig = sign_with_secret(secret, &canonical);
    format!("{canonical}|{}", hex::encode(sig))
}

/// Verify a magic link's HMAC and timestamp freshness (does not check
/// single-use — call [`meridian_storage::memory::MemoryStore::consume_magic_link`]
/// for that). Returns the embedded `random_hash` on success.
pub fn verify_magic_link(link: &str, secret: &str, ttl: Duration, now: DateTime<Utc>) -> RelayResult<String> {
    let parts: Vec<&str> = link.split('|').collect();
    let [server_url, random_hash, timestamp_str, sig_hex] = parts[..] else {
        return Err(RelayError::validation("malformed magic link"));
    };
    let timestamp: i64 = timestamp_str.parse().map_err(|_| RelayError::validation("malformed magic link timestamp"))?;
    let issued = DateTime::from_timestamp(timestamp, 0).ok_or_else(|| RelayError::validation("malformed magic link timestamp"))?;
    if now - issued > ttl {
        return Err(RelayError::auth_invalid("magic link expired"));
    }

    let canonical = format!("{server_url}|{random_hash}|{timestamp}");
    let expected = sign_with_secret(secret, &canonical);
    let provided = hex::decode(sig_hex).map_err(|_| RelayError::validation("malformed magic link signature"))?;
    if expected.ct_eq(&provided).unwrap_u8() != 1 {
        return Err(RelayError::auth_invalid("magic link signature mismatch"));
    }
    Ok(random_hash.to_string())
}

fn sign_with_secret(secret: &str, canonical: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_is_five_digits() {
        for _ in 0..20 {
            assert_eq!(generate_otp().len(), 5);
        }
    }

    #[test]
    fn backup_codes_round_trip_through_bcrypt() {
        let (plain, hashes) = generate_backup_codes(10).unwrap();
        assert_eq!(plain.len(), 10);
        assert_eq!(hashes.len(), 10);
        let codes: Vec<_> = hashes
            .iter()
            .map(|h| meridian_common::models::user::BackupCode { hash: h.clone(), used: false })
            .collect();
        assert!(verify_backup_code(&plain[3], &codes).is_some());
        assert!(verify_backup_code("not-a-real-code", &codes).is_none());
    }

    #[test]
    fn regeneration_floor_trips_once_enough_codes_are_used() {
        let codes: Vec<_> = (0..10)
            .map(|i| meridian_common::models::user::BackupCode { hash: format!("h{i}"), used: i < 8 })
            .collect();
        assert!(backup_codes_need_regeneration(&codes, 8));
    }

    #[test]
    fn magic_link_round_trips() {
        let now = Utc::now();
        let link = build_magic_link("https://relay.example.com", "rand123", now.timestamp(), "secret");
        let hash = verify_magic_link(&link, "secret", Duration::seconds(300), now).unwrap();
        assert_eq!(hash, "rand123");
        assert!(verify_magic_link(&link, "wrong-secret", Duration::seconds(300), now).is_err());
    }
}
