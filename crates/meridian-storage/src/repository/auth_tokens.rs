//! Refresh tokens, HMAC client sessions, and the hand-off `jti` blacklist (C3).

use chrono::{DateTime, Utc};
use meridian_common::error::RelayResult;
use meridian_common::models::session::{ClientSession, RefreshToken};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn row_to_refresh_token(row: &rusqlite::Row) -> rusqlite::Result<RefreshToken> {
    Ok(RefreshToken {
        token: row.get(0)?,
        client_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        user_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        expires_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
        used_at: row.get::<_, Option<String>>(4)?.and_then(|s| s.parse().ok()),
        rotation_count: row.get(5)?,
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_REFRESH_TOKEN: &str =
    "SELECT token, client_id, user_id, expires_at, used_at, rotation_count, created_at FROM refresh_tokens";

/// A random 32-byte refresh token / HMAC session secret, hex-encoded.
pub fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn create_refresh_token(
    conn: &Connection,
    client_id: Uuid,
    user_id: Uuid,
    ttl: chrono::Duration,
) -> RelayResult<RefreshToken> {
    let token = random_secret();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO refresh_tokens (token, client_id, user_id, expires_at, used_at, rotation_count, created_at)
         VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5)",
        params![token, client_id.to_string(), user_id.to_string(), (now + ttl).to_rfc3339(), now.to_rfc3339()],
    )?;
    Ok(find_refresh_token(conn, &token)?.expect("just inserted"))
}

pub fn find_refresh_token(conn: &Connection, token: &str) -> RelayResult<Option<RefreshToken>> {
    conn.query_row(&format!("{SELECT_REFRESH_TOKEN} WHERE token = ?1"), params![token], row_to_refresh_token)
        .optional()
        .map_err(Into::into)
}

/// Rotate `old_token`: mark it used and mint a new token + new `client_session`
/// secret in one write. Returns `None` if `old_token` doesn't exist, is
/// expired, or was already used (the caller must treat that as a replay and
/// the token as destroyed).
pub fn rotate_refresh_token(
    conn: &Connection,
    old_token: &str,
    ttl: chrono::Duration,
) -> RelayResult<Option<RefreshToken>> {
    let Some(existing) = find_refresh_token(conn, old_token)? else { return Ok(None) };
    let now = Utc::now();
    if existing.used_at.is_some() || existing.expires_at < now {
        destroy_refresh_token(conn, old_token)?;
        return Ok(None);
    }
    conn.execute(
        "UPDATE refresh_tokens SET used_at = ?2 WHERE token = ?1",
        params![old_token, now.to_rfc3339()],
    )?;
    let next = create_refresh_token(conn, existing.client_id, existing.user_id, ttl)?;
    conn.execute(
        "UPDATE refresh_tokens SET rotation_count = ?2 WHERE token = ?1",
        params![next.token, existing.rotation_count + 1],
    )?;
    find_refresh_token(conn, &next.token)
}

pub fn destroy_refresh_token(conn: &Connection, token: &str) -> RelayResult<()> {
    conn.execute("DELETE FROM refresh_tokens WHERE token = ?1", params![token])?;
    Ok(())
}

fn row_to_client_session(row: &rusqlite::Row) -> rusqlite::Result<ClientSession> {
    Ok(ClientSession {
        client_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        session_secret: row.get(1)?,
        user_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        device_id: row.get(3)?,
        expires_at: row.get::<_, String>(4)?.parse().unwrap_or_else(|_| Utc::now()),
        last_used: row.get::<_, Option<String>>(5)?.and_then(|s| s.parse().ok()),
        device_info: row.get(6)?,
    })
}

const SELECT_CLIENT_SESSION: &str =
    "SELECT client_id, session_secret, user_id, device_id, expires_at, last_used, device_info FROM client_sessions";

/// Create or rotate the HMAC session for `client_id`. Only the owning
/// client writes this row, so last-write-wins is the correct semantics.
pub fn upsert_client_session(
    conn: &Connection,
    client_id: Uuid,
    user_id: Uuid,
    device_id: i64,
    ttl: chrono::Duration,
    device_info: Option<&str>,
) -> RelayResult<ClientSession> {
    let secret = random_secret();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO client_sessions (client_id, session_secret, user_id, device_id, expires_at, last_used, device_info)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (client_id) DO UPDATE SET
            session_secret = excluded.session_secret,
            expires_at = excluded.expires_at,
            last_used = excluded.last_used,
            device_info = excluded.device_info",
        params![
            client_id.to_string(),
            secret,
            user_id.to_string(),
            device_id,
            (now + ttl).to_rfc3339(),
            now.to_rfc3339(),
            device_info,
        ],
    )?;
    find_client_session(conn, client_id)?.ok_or_else(|| {
        meridian_common::error::RelayError::internal("client session vanished after upsert")
    })
}

/// Every client session belonging to `user_id`, for the `/sessions/list` surface.
pub fn list_sessions_for_user(conn: &Connection, user_id: Uuid) -> RelayResult<Vec<ClientSession>> {
    let mut stmt = conn.prepare(&format!("{SELECT_CLIENT_SESSION} WHERE user_id = ?1"))?;
    let rows = stmt.query_map(params![user_id.to_string()], row_to_client_session)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// `/sessions/revoke-all` — drop every device's session for this user at once.
pub fn delete_all_client_sessions_for_user(conn: &Connection, user_id: Uuid) -> RelayResult<usize> {
    Ok(conn.execute("DELETE FROM client_sessions WHERE user_id = ?1", params![user_id.to_string()])?)
}

pub fn find_client_session(conn: &Connection, client_id: Uuid) -> RelayResult<Option<ClientSession>> {
    conn.query_row(
        &format!("{SELECT_CLIENT_SESSION} WHERE client_id = ?1"),
        params![client_id.to_string()],
        row_to_client_session,
    )
    .optional()
    .map_err(Into::into)
}

/// Extend an existing session's expiry without rotating its secret (`/session/refresh`).
pub fn extend_client_session(conn: &Connection, client_id: Uuid, ttl: chrono::Duration) -> RelayResult<()> {
    let now = Utc::now();
    conn.execute(
        "UPDATE client_sessions SET expires_at = ?2, last_used = ?3 WHERE client_id = ?1",
        params![client_id.to_string(), (now + ttl).to_rfc3339(), now.to_rfc3339()],
    )?;
    Ok(())
}

/// Logout over HMAC: delete the session row for `client_id`.
pub fn delete_client_session(conn: &Connection, client_id: Uuid) -> RelayResult<()> {
    conn.execute("DELETE FROM client_sessions WHERE client_id = ?1", params![client_id.to_string()])?;
    Ok(())
}

pub fn purge_expired_client_sessions(conn: &Connection, now: DateTime<Utc>) -> RelayResult<usize> {
    Ok(conn.execute("DELETE FROM client_sessions WHERE expires_at < ?1", params![now.to_rfc3339()])?)
}

pub fn purge_expired_refresh_tokens(conn: &Connection, now: DateTime<Utc>) -> RelayResult<usize> {
    Ok(conn.execute("DELETE FROM refresh_tokens WHERE expires_at < ?1", params![now.to_rfc3339()])?)
}

// --- Hand-off token jti blacklist (one-shot redemption) ---

/// Record `jti` as redeemed until `exp`. A second redemption attempt for the
/// same `jti` must be rejected by the caller checking [`is_blacklisted`] first.
pub fn blacklist_jti(conn: &Connection, jti: &str, exp: DateTime<Utc>) -> RelayResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO handoff_jti_blacklist (jti, exp) VALUES (?1, ?2)",
        params![jti, exp.to_rfc3339()],
    )?;
    Ok(())
}

pub fn is_blacklisted(conn: &Connection, jti: &str) -> RelayResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM handoff_jti_blacklist WHERE jti = ?1",
        params![jti],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn purge_expired_blacklist_entries(conn: &Connection, now: DateTime<Utc>) -> RelayResult<usize> {
    Ok(conn.execute("DELETE FROM handoff_jti_blacklist WHERE exp < ?1", params![now.to_rfc3339()])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../schema.sql")).unwrap();
        conn
    }

    #[test]
    fn refresh_token_rotation_invalidates_the_old_token() {
        let conn = test_conn();
        let client_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let first = create_refresh_token(&conn, client_id, user_id, chrono::Duration::days(90)).unwrap();
        let second = rotate_refresh_token(&conn, &first.token, chrono::Duration::days(90)).unwrap().unwrap();
        assert_ne!(first.token, second.token);
        // Reusing the now-used first token must fail.
        let replay = rotate_refresh_token(&conn, &first.token, chrono::Duration::days(90)).unwrap();
        assert!(replay.is_none());
        assert!(find_refresh_token(&conn, &first.token).unwrap().is_none());
    }

    #[test]
    fn client_session_upsert_is_last_write_wins() {
        let conn = test_conn();
        let client_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let first = upsert_client_session(&conn, client_id, user_id, 1, chrono::Duration::days(90), None).unwrap();
        let second = upsert_client_session(&conn, client_id, user_id, 1, chrono::Duration::days(90), None).unwrap();
        assert_ne!(first.session_secret, second.session_secret);
        let found = find_client_session(&conn, client_id).unwrap().unwrap();
        assert_eq!(found.session_secret, second.session_secret);
    }

    #[test]
    fn jti_blacklist_is_one_shot() {
        let conn = test_conn();
        let exp = Utc::now() + chrono::Duration::seconds(60);
        assert!(!is_blacklisted(&conn, "abc").unwrap());
        blacklist_jti(&conn, "abc", exp).unwrap();
        assert!(is_blacklisted(&conn, "abc").unwrap());
    }
}
