//! User repository — CRUD for accounts, WebAuthn credentials, and backup codes.

use chrono::Utc;
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::user::{BackupCode, NotificationPrefs, User, WebAuthnCredential};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

fn row_to_user(conn: &Connection, row: &Row) -> rusqlite::Result<User> {
    let id: String = row.get("id")?;
    let id = Uuid::parse_str(&id).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let prefs_json: String = row.get("notification_prefs")?;
    let notification_prefs: NotificationPrefs = serde_json::from_str(&prefs_json).unwrap_or_default();

    let credentials = load_credentials(conn, id)?;
    let backup_codes = load_backup_codes(conn, id)?;

    Ok(User {
        id,
        email: row.get("email")?,
        verified: row.get::<_, i64>("verified")? != 0,
        display_name: row.get("display_name")?,
        at_name: row.get("at_name")?,
        credentials,
        backup_codes,
        picture: row.get("picture")?,
        active: row.get::<_, i64>("active")? != 0,
        notification_prefs,
        created_at: row.get::<_, String>("created_at")?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>("updated_at")?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn load_credentials(conn: &Connection, user_id: Uuid) -> rusqlite::Result<Vec<WebAuthnCredential>> {
    let mut stmt = conn.prepare(
        "SELECT id, passkey_json, transports, created_at, last_login, browser, ip, location
         FROM webauthn_credentials WHERE user_id = ?1",
    )?;
    let rows = stmt.query_map(params![user_id.to_string()], |row| {
        let transports_json: String = row.get(2)?;
        Ok(WebAuthnCredential {
            id: row.get(0)?,
            passkey_json: row.get(1)?,
            transports: serde_json::from_str(&transports_json).unwrap_or_default(),
            created_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
            last_login: row.get::<_, Option<String>>(4)?.and_then(|s| s.parse().ok()),
            browser: row.get(5)?,
            ip: row.get(6)?,
            location: row.get(7)?,
        })
    })?;
    rows.collect()
}

fn load_backup_codes(conn: &Connection, user_id: Uuid) -> rusqlite::Result<Vec<BackupCode>> {
    let mut stmt = conn.prepare("SELECT hash, used FROM backup_codes WHERE user_id = ?1")?;
    let rows = stmt.query_map(params![user_id.to_string()], |row| {
        Ok(BackupCode {
            hash: row.get(0)?,
            used: row.get::<_, i64>(1)? != 0,
        })
    })?;
    rows.collect()
}

pub fn create_user(conn: &Connection, email: &str) -> RelayResult<User> {
    let now = Utc::now();
    let id = meridian_common::id::generate_id();
    conn.execute(
        "INSERT INTO users (id, email, verified, notification_prefs, created_at, updated_at)
         VALUES (?1, ?2, 0, '{}', ?3, ?3)",
        params![id.to_string(), email, now.to_rfc3339()],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            RelayError::conflict(format!("a user already exists for {email}"))
        }
        other => RelayError::from(other),
    })?;

    find_by_id(conn, id)?.ok_or_else(|| RelayError::internal("user vanished immediately after insert"))
}

pub fn find_by_id(conn: &Connection, id: Uuid) -> RelayResult<Option<User>> {
    conn.query_row("SELECT * FROM users WHERE id = ?1", params![id.to_string()], |row| {
        row_to_user(conn, row)
    })
    .optional()
    .map_err(RelayError::from)
}

pub fn find_by_email(conn: &Connection, email: &str) -> RelayResult<Option<User>> {
    conn.query_row(
        "SELECT * FROM users WHERE LOWER(email) = LOWER(?1)",
        params![email],
        |row| row_to_user(conn, row),
    )
    .optional()
    .map_err(RelayError::from)
}

/// Flip `active`. Set on successful WebAuthn/backup-code authentication, per
/// the registration/auth state machine.
pub fn set_active(conn: &Connection, id: Uuid, active: bool) -> RelayResult<()> {
    conn.execute(
        "UPDATE users SET active = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), active as i64, Utc::now().to_rfc3339()],
    )
    .map_err(RelayError::from)?;
    Ok(())
}

pub fn mark_verified(conn: &Connection, id: Uuid) -> RelayResult<()> {
    conn.execute(
        "UPDATE users SET verified = 1, updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), Utc::now().to_rfc3339()],
    )
    .map_err(RelayError::from)?;
    Ok(())
}

pub fn update_profile(
    conn: &Connection,
    id: Uuid,
    display_name: Option<&str>,
    at_name: Option<&str>,
    picture: Option<&str>,
) -> RelayResult<()> {
    conn.execute(
        "UPDATE users SET
            display_name = COALESCE(?2, display_name),
            at_name = COALESCE(?3, at_name),
            picture = COALESCE(?4, picture),
            updated_at = ?5
         WHERE id = ?1",
        params![id.to_string(), display_name, at_name, picture, Utc::now().to_rfc3339()],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            RelayError::conflict("at_name already taken")
        }
        other => RelayError::from(other),
    })?;
    Ok(())
}

pub fn add_credential(conn: &Connection, user_id: Uuid, cred: &WebAuthnCredential) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO webauthn_credentials (id, user_id, passkey_json, transports, created_at, last_login, browser, ip, location)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            cred.id,
            user_id.to_string(),
            cred.passkey_json,
            serde_json::to_string(&cred.transports).unwrap_or_default(),
            cred.created_at.to_rfc3339(),
            cred.last_login.map(|t| t.to_rfc3339()),
            cred.browser,
            cred.ip,
            cred.location,
        ],
    )
    .map_err(RelayError::from)?;
    Ok(())
}

/// Refuses to delete a user's last remaining credential.
pub fn delete_credential(conn: &Connection, user_id: Uuid, credential_id: &str) -> RelayResult<()> {
    let remaining: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM webauthn_credentials WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )
        .map_err(RelayError::from)?;
    if remaining <= 1 {
        return Err(RelayError::conflict("cannot delete the last passkey"));
    }
    conn.execute(
        "DELETE FROM webauthn_credentials WHERE user_id = ?1 AND id = ?2",
        params![user_id.to_string(), credential_id],
    )
    .map_err(RelayError::from)?;
    Ok(())
}

pub fn touch_credential_login(conn: &Connection, credential_id: &str) -> RelayResult<()> {
    conn.execute(
        "UPDATE webauthn_credentials SET last_login = ?2 WHERE id = ?1",
        params![credential_id, Utc::now().to_rfc3339()],
    )
    .map_err(RelayError::from)?;
    Ok(())
}

/// Replaces a user's backup-code set (regeneration).
pub fn set_backup_codes(conn: &Connection, user_id: Uuid, hashes: &[String]) -> RelayResult<()> {
    conn.execute("DELETE FROM backup_codes WHERE user_id = ?1", params![user_id.to_string()])
        .map_err(RelayError::from)?;
    for hash in hashes {
        conn.execute(
            "INSERT INTO backup_codes (user_id, hash, used) VALUES (?1, ?2, 0)",
            params![user_id.to_string(), hash],
        )
        .map_err(RelayError::from)?;
    }
    Ok(())
}

pub fn mark_backup_code_used(conn: &Connection, user_id: Uuid, hash: &str) -> RelayResult<()> {
    conn.execute(
        "UPDATE backup_codes SET used = 1 WHERE user_id = ?1 AND hash = ?2",
        params![user_id.to_string(), hash],
    )
    .map_err(RelayError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../schema.sql")).unwrap();
        conn
    }

    fn credential(id: &str) -> WebAuthnCredential {
        WebAuthnCredential {
            id: id.to_string(),
            passkey_json: "{}".to_string(),
            transports: vec!["internal".to_string()],
            created_at: Utc::now(),
            last_login: None,
            browser: None,
            ip: None,
            location: None,
        }
    }

    #[test]
    fn create_user_rejects_duplicate_email() {
        let conn = test_conn();
        create_user(&conn, "alice@example.com").unwrap();
        let err = create_user(&conn, "ALICE@example.com").unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));
    }

    #[test]
    fn find_by_email_is_case_insensitive() {
        let conn = test_conn();
        let user = create_user(&conn, "Bob@Example.com").unwrap();
        let found = find_by_email(&conn, "bob@example.com").unwrap().unwrap();
        assert_eq!(found.id, user.id);
    }

    #[test]
    fn delete_credential_refuses_to_remove_the_last_one() {
        let conn = test_conn();
        let user = create_user(&conn, "carol@example.com").unwrap();
        add_credential(&conn, user.id, &credential("cred-1")).unwrap();
        let err = delete_credential(&conn, user.id, "cred-1").unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));

        add_credential(&conn, user.id, &credential("cred-2")).unwrap();
        delete_credential(&conn, user.id, "cred-1").unwrap();
        let remaining = find_by_id(&conn, user.id).unwrap().unwrap().credentials;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "cred-2");
    }

    #[test]
    fn backup_codes_round_trip_and_mark_used() {
        let conn = test_conn();
        let user = create_user(&conn, "dave@example.com").unwrap();
        set_backup_codes(&conn, user.id, &["hash-a".to_string(), "hash-b".to_string()]).unwrap();

        mark_backup_code_used(&conn, user.id, "hash-a").unwrap();
        let codes = find_by_id(&conn, user.id).unwrap().unwrap().backup_codes;
        assert_eq!(codes.len(), 2);
        assert!(codes.iter().find(|c| c.hash == "hash-a").unwrap().used);
        assert!(!codes.iter().find(|c| c.hash == "hash-b").unwrap().used);
    }
}
