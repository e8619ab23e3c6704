//! Signal Key Directory repository (C5).
//!
//! Pre-keys are consumed exactly once on bundle fetch — DELETE-then-RETURN
//! inside a single writer task, so concurrent fetches never hand out the
//! same one-time pre-key twice. Signed pre-keys and sender keys are
//! overwritable, last-write-wins.

use chrono::Utc;
use meridian_common::error::RelayResult;
use meridian_common::models::crypto::{KeyBundle, OneTimePreKeyPublic};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub fn upload_prekeys(conn: &Connection, client_id: Uuid, owner: Uuid, keys: &[(i32, String)]) -> RelayResult<usize> {
    let mut inserted = 0usize;
    for (prekey_id, prekey_data) in keys {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO prekeys (client_id, owner, prekey_id, prekey_data) VALUES (?1, ?2, ?3, ?4)",
            params![client_id.to_string(), owner.to_string(), prekey_id, prekey_data],
        )?;
        inserted += changed;
    }
    Ok(inserted)
}

pub fn remaining_prekey_count(conn: &Connection, client_id: Uuid) -> RelayResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM prekeys WHERE client_id = ?1",
        params![client_id.to_string()],
        |row| row.get(0),
    )?)
}

/// Delete-then-return exactly one pre-key, oldest `prekey_id` first.
fn consume_prekey(conn: &Connection, client_id: Uuid) -> RelayResult<Option<OneTimePreKeyPublic>> {
    let row: Option<(i32, String)> = conn
        .query_row(
            "SELECT prekey_id, prekey_data FROM prekeys WHERE client_id = ?1 ORDER BY prekey_id ASC LIMIT 1",
            params![client_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((prekey_id, prekey_data)) = row else {
        return Ok(None);
    };

    conn.execute(
        "DELETE FROM prekeys WHERE client_id = ?1 AND prekey_id = ?2",
        params![client_id.to_string(), prekey_id],
    )?;

    Ok(Some(OneTimePreKeyPublic { prekey_id, prekey_data }))
}

pub fn rotate_signed_prekey(
    conn: &Connection,
    client_id: Uuid,
    owner: Uuid,
    signed_prekey_id: i32,
    signed_prekey_data: &str,
    signed_prekey_signature: &str,
) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO signed_prekeys (client_id, owner, signed_prekey_id, signed_prekey_data, signed_prekey_signature, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (client_id) DO UPDATE SET
            signed_prekey_id = excluded.signed_prekey_id,
            signed_prekey_data = excluded.signed_prekey_data,
            signed_prekey_signature = excluded.signed_prekey_signature,
            updated_at = excluded.updated_at",
        params![
            client_id.to_string(),
            owner.to_string(),
            signed_prekey_id,
            signed_prekey_data,
            signed_prekey_signature,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch a full key bundle for an X3DH initiator, consuming one pre-key.
/// `identity_key` comes from the recipient's `Client.public_key`.
pub fn get_key_bundle(conn: &Connection, client_id: Uuid, identity_key: Option<String>) -> RelayResult<Option<KeyBundle>> {
    let signed: Option<(Uuid, i32, String, String)> = conn
        .query_row(
            "SELECT owner, signed_prekey_id, signed_prekey_data, signed_prekey_signature FROM signed_prekeys WHERE client_id = ?1",
            params![client_id.to_string()],
            |row| {
                let owner: String = row.get(0)?;
                Ok((owner.parse().unwrap_or_default(), row.get(1)?, row.get(2)?, row.get(3)?))
            },
        )
        .optional()?;

    let Some((owner, signed_prekey_id, signed_prekey_data, signed_prekey_signature)) = signed else {
        return Ok(None);
    };

    let one_time_prekey = consume_prekey(conn, client_id)?;

    Ok(Some(KeyBundle {
        client_id,
        owner,
        identity_key,
        signed_prekey_id,
        signed_prekey_data,
        signed_prekey_signature,
        one_time_prekey,
    }))
}

pub fn upload_sender_key(conn: &Connection, channel_id: Uuid, client_id: Uuid, owner: Uuid, sender_key: &str) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO sender_keys (channel_id, client_id, owner, sender_key, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (channel_id, client_id) DO UPDATE SET
            sender_key = excluded.sender_key,
            updated_at = excluded.updated_at",
        params![channel_id.to_string(), client_id.to_string(), owner.to_string(), sender_key, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn sender_keys_for_channel(conn: &Connection, channel_id: Uuid) -> RelayResult<Vec<(Uuid, Uuid, String)>> {
    let mut stmt = conn.prepare("SELECT client_id, owner, sender_key FROM sender_keys WHERE channel_id = ?1")?;
    let rows = stmt.query_map(params![channel_id.to_string()], |row| {
        let client_id: String = row.get(0)?;
        let owner: String = row.get(1)?;
        Ok((client_id.parse().unwrap_or_default(), owner.parse().unwrap_or_default(), row.get(2)?))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
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
    fn consume_prekey_is_one_shot_oldest_first() {
        let conn = test_conn();
        let client_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        upload_prekeys(&conn, client_id, owner, &[(2, "two".to_string()), (1, "one".to_string())]).unwrap();
        rotate_signed_prekey(&conn, client_id, owner, 10, "signed-data", "signature").unwrap();

        let bundle = get_key_bundle(&conn, client_id, Some("identity".to_string())).unwrap().unwrap();
        let otk = bundle.one_time_prekey.unwrap();
        assert_eq!(otk.prekey_id, 1, "oldest prekey_id must be consumed first");
        assert_eq!(remaining_prekey_count(&conn, client_id).unwrap(), 1);

        let bundle2 = get_key_bundle(&conn, client_id, None).unwrap().unwrap();
        assert_eq!(bundle2.one_time_prekey.unwrap().prekey_id, 2);
        assert_eq!(remaining_prekey_count(&conn, client_id).unwrap(), 0);

        let bundle3 = get_key_bundle(&conn, client_id, None).unwrap().unwrap();
        assert!(bundle3.one_time_prekey.is_none(), "no prekeys left, bundle still returns the signed prekey");
    }

    #[test]
    fn upload_prekeys_ignores_duplicate_ids() {
        let conn = test_conn();
        let client_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let inserted = upload_prekeys(&conn, client_id, owner, &[(1, "one".to_string())]).unwrap();
        assert_eq!(inserted, 1);
        let inserted_again = upload_prekeys(&conn, client_id, owner, &[(1, "one-replay".to_string())]).unwrap();
        assert_eq!(inserted_again, 0);
        assert_eq!(remaining_prekey_count(&conn, client_id).unwrap(), 1);
    }

    #[test]
    fn rotate_signed_prekey_overwrites() {
        let conn = test_conn();
        let client_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        rotate_signed_prekey(&conn, client_id, owner, 1, "first", "sig-1").unwrap();
        rotate_signed_prekey(&conn, client_id, owner, 2, "second", "sig-2").unwrap();

        let bundle = get_key_bundle(&conn, client_id, None).unwrap().unwrap();
        assert_eq!(bundle.signed_prekey_id, 2);
        assert_eq!(bundle.signed_prekey_data, "second");
    }

    #[test]
    fn get_key_bundle_is_none_without_a_signed_prekey() {
        let conn = test_conn();
        assert!(get_key_bundle(&conn, Uuid::new_v4(), None).unwrap().is_none());
    }

    #[test]
    fn sender_key_upload_is_last_write_wins_per_client() {
        let conn = test_conn();
        let channel_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        upload_sender_key(&conn, channel_id, client_id, owner, "key-v1").unwrap();
        upload_sender_key(&conn, channel_id, client_id, owner, "key-v2").unwrap();

        let keys = sender_keys_for_channel(&conn, channel_id).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].2, "key-v2");
    }
}
