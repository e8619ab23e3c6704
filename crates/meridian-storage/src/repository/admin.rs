//! Server Admin repository (C10) — the single-row `ServerSettings` and
//! 6-character signup invitations (distinct from meeting invitation tokens).

use chrono::{DateTime, Utc};
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::admin::{Invitation, RegistrationMode, ServerSettings};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn row_to_settings(row: &rusqlite::Row) -> rusqlite::Result<ServerSettings> {
    let suffixes_json: String = row.get(4)?;
    Ok(ServerSettings {
        id: row.get(0)?,
        server_name: row.get(1)?,
        server_picture: row.get(2)?,
        registration_mode: RegistrationMode::from_str(&row.get::<_, String>(3)?),
        allowed_email_suffixes: serde_json::from_str(&suffixes_json).unwrap_or_default(),
        updated_at: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_SETTINGS: &str =
    "SELECT id, server_name, server_picture, registration_mode, allowed_email_suffixes, updated_at FROM server_settings WHERE id = 1";

/// Fetch the singleton row, seeding defaults on first access.
pub fn get_settings(conn: &Connection) -> RelayResult<ServerSettings> {
    if let Some(settings) = conn.query_row(SELECT_SETTINGS, [], row_to_settings).optional()? {
        return Ok(settings);
    }
    let defaults = ServerSettings::default();
    conn.execute(
        "INSERT INTO server_settings (id, server_name, server_picture, registration_mode, allowed_email_suffixes, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)",
        params![
            defaults.server_name,
            defaults.server_picture,
            defaults.registration_mode.as_str(),
            serde_json::to_string(&defaults.allowed_email_suffixes).unwrap_or_default(),
            defaults.updated_at.to_rfc3339(),
        ],
    )?;
    conn.query_row(SELECT_SETTINGS, [], row_to_settings).map_err(Into::into)
}

#[allow(clippy::too_many_arguments)]
pub fn update_settings(
    conn: &Connection,
    server_name: Option<&str>,
    server_picture: Option<&str>,
    registration_mode: Option<RegistrationMode>,
    allowed_email_suffixes: Option<&[String]>,
) -> RelayResult<ServerSettings> {
    // Ensure the row exists before the COALESCE update below.
    get_settings(conn)?;
    conn.execute(
        "UPDATE server_settings SET
            server_name = COALESCE(?1, server_name),
            server_picture = COALESCE(?2, server_picture),
            registration_mode = COALESCE(?3, registration_mode),
            allowed_email_suffixes = COALESCE(?4, allowed_email_suffixes),
            updated_at = ?5
         WHERE id = 1",
        params![
            server_name,
            server_picture,
            registration_mode.map(RegistrationMode::as_str),
            allowed_email_suffixes.map(|s| serde_json::to_string(s).unwrap_or_default()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    get_settings(conn)
}

fn row_to_invitation(row: &rusqlite::Row) -> rusqlite::Result<Invitation> {
    Ok(Invitation {
        email: row.get(0)?,
        token: row.get(1)?,
        created_by: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        expires_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
        used: row.get::<_, i64>(4)? != 0,
        used_at: row.get::<_, Option<String>>(5)?.and_then(|s| s.parse().ok()),
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_INVITATION: &str =
    "SELECT email, token, created_by, expires_at, used, used_at, created_at FROM invitations";

/// Mint a 6-character signup invitation for `email`, expiring in `ttl`.
pub fn create_invitation(
    conn: &Connection,
    email: &str,
    created_by: Uuid,
    ttl: chrono::Duration,
) -> RelayResult<Invitation> {
    let token = crate::random_token(6);
    let now = Utc::now();
    conn.execute(
        "INSERT INTO invitations (email, token, created_by, expires_at, used, used_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
        params![email, token, created_by.to_string(), (now + ttl).to_rfc3339(), now.to_rfc3339()],
    )?;
    find_invitation(conn, &token)?.ok_or_else(|| RelayError::internal("invitation vanished after insert"))
}

pub fn find_invitation(conn: &Connection, token: &str) -> RelayResult<Option<Invitation>> {
    conn.query_row(&format!("{SELECT_INVITATION} WHERE token = ?1"), params![token], row_to_invitation)
        .optional()
        .map_err(Into::into)
}

pub fn list_invitations(conn: &Connection) -> RelayResult<Vec<Invitation>> {
    let mut stmt = conn.prepare(&format!("{SELECT_INVITATION} ORDER BY created_at DESC"))?;
    let rows = stmt.query_map([], row_to_invitation)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Check `(email, token)` matches an unexpired, unused invitation without
/// consuming it. `/register` under `invitation_only` uses this so the token
/// is only actually spent once the registration's OTP step succeeds.
pub fn invitation_is_valid(conn: &Connection, email: &str, token: &str, now: DateTime<Utc>) -> RelayResult<bool> {
    let valid: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM invitations WHERE email = ?1 AND token = ?2 AND used = 0 AND expires_at > ?3",
            params![email, token, now.to_rfc3339()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(valid.is_some())
}

/// Verify `(email, token)` matches an unexpired, unused invitation and mark
/// it used — called once OTP verification actually succeeds (or from the
/// standalone `/admin/invitations/verify` / `/api/invitations/verify` routes).
pub fn verify_and_consume_invitation(conn: &Connection, email: &str, token: &str, now: DateTime<Utc>) -> RelayResult<bool> {
    let changed = conn.execute(
        "UPDATE invitations SET used = 1, used_at = ?4
         WHERE email = ?1 AND token = ?2 AND used = 0 AND expires_at > ?3",
        params![email, token, now.to_rfc3339(), now.to_rfc3339()],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../schema.sql")).unwrap();
        conn
    }

    #[test]
    fn get_settings_seeds_defaults_on_first_access() {
        let conn = test_conn();
        let settings = get_settings(&conn).unwrap();
        assert_eq!(settings.id, 1);
        assert_eq!(settings.registration_mode, RegistrationMode::Open);
    }

    #[test]
    fn update_settings_preserves_unspecified_fields() {
        let conn = test_conn();
        get_settings(&conn).unwrap();
        let updated = update_settings(&conn, Some("New Name"), None, Some(RegistrationMode::InvitationOnly), None).unwrap();
        assert_eq!(updated.server_name, "New Name");
        assert_eq!(updated.registration_mode, RegistrationMode::InvitationOnly);
    }

    #[test]
    fn invitation_round_trips_and_consumes_once() {
        let conn = test_conn();
        let creator = Uuid::now_v7();
        let inv = create_invitation(&conn, "person@example.com", creator, chrono::Duration::days(7)).unwrap();
        assert_eq!(inv.token.len(), 6);
        let now = Utc::now();
        assert!(verify_and_consume_invitation(&conn, "person@example.com", &inv.token, now).unwrap());
        assert!(!verify_and_consume_invitation(&conn, "person@example.com", &inv.token, now).unwrap());
    }
}
