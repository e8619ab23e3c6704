//! Client (device) repository, including the ownership-transfer purge rule:
//! if a `client_id` is presented by a different owner than recorded, every
//! piece of that device's server-side state must be purged before re-binding.

use chrono::Utc;
use meridian_common::error::RelayResult;
use meridian_common::models::client::{Client, DeviceInfo};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<Client> {
    Ok(Client {
        client_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        owner: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        device_id: row.get(2)?,
        public_key: row.get(3)?,
        registration_id: row.get(4)?,
        ip: row.get(5)?,
        browser: row.get(6)?,
        location: row.get(7)?,
        created_at: row.get::<_, String>(8)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(9)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

pub fn find_by_client_id(conn: &Connection, client_id: Uuid) -> RelayResult<Option<Client>> {
    conn.query_row(
        "SELECT client_id, owner, device_id, public_key, registration_id, ip, browser, location, created_at, updated_at
         FROM clients WHERE client_id = ?1",
        params![client_id.to_string()],
        row_to_client,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_for_owner(conn: &Connection, owner: Uuid) -> RelayResult<Vec<Client>> {
    let mut stmt = conn.prepare(
        "SELECT client_id, owner, device_id, public_key, registration_id, ip, browser, location, created_at, updated_at
         FROM clients WHERE owner = ?1 ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![owner.to_string()], row_to_client)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Find-or-create a client, applying the ownership-transfer purge when the
/// `client_id` is presented by a different owner than recorded.
pub fn find_or_create_client(
    conn: &Connection,
    client_id: Uuid,
    owner: Uuid,
    device_info: &DeviceInfo,
) -> RelayResult<Client> {
    if let Some(existing) = find_by_client_id(conn, client_id)? {
        if existing.owner == owner {
            conn.execute(
                "UPDATE clients SET ip = COALESCE(?2, ip), browser = COALESCE(?3, browser),
                    location = COALESCE(?4, location),
                    public_key = COALESCE(?5, public_key),
                    registration_id = COALESCE(?6, registration_id),
                    updated_at = ?7
                 WHERE client_id = ?1",
                params![
                    client_id.to_string(),
                    device_info.ip,
                    device_info.browser,
                    device_info.location,
                    device_info.public_key,
                    device_info.registration_id,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            return find_by_client_id(conn, client_id)?
                .ok_or_else(|| meridian_common::error::RelayError::internal("client vanished after update"));
        }
        purge_device_state(conn, client_id)?;
        conn.execute("DELETE FROM clients WHERE client_id = ?1", params![client_id.to_string()])?;
    }

    let device_id = next_device_id(conn, owner)?;
    let now = Utc::now();
    conn.execute(
        "INSERT INTO clients (client_id, owner, device_id, public_key, registration_id, ip, browser, location, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            client_id.to_string(),
            owner.to_string(),
            device_id,
            device_info.public_key,
            device_info.registration_id,
            device_info.ip,
            device_info.browser,
            device_info.location,
            now.to_rfc3339(),
        ],
    )?;

    find_by_client_id(conn, client_id)?
        .ok_or_else(|| meridian_common::error::RelayError::internal("client vanished after insert"))
}

fn next_device_id(conn: &Connection, owner: Uuid) -> RelayResult<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(device_id) FROM clients WHERE owner = ?1",
        params![owner.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

/// Purges every piece of server-side state tied to `client_id`: 1:1 envelopes
/// sent/received by the device, this device's group read-receipts, Signal
/// key rows, and HMAC session rows. Must run before ownership transfer.
/// Group sends themselves (`group_items`) are shared channel history, not
/// per-device state, and aren't touched.
pub fn purge_device_state(conn: &Connection, client_id: Uuid) -> RelayResult<()> {
    let cid = client_id.to_string();
    conn.execute("DELETE FROM items WHERE sender_device = ?1 OR recipient_device = ?1", params![cid])?;
    conn.execute("DELETE FROM group_item_reads WHERE device_id = ?1", params![cid])?;
    conn.execute("DELETE FROM prekeys WHERE client_id = ?1", params![cid])?;
    conn.execute("DELETE FROM signed_prekeys WHERE client_id = ?1", params![cid])?;
    conn.execute("DELETE FROM sender_keys WHERE client_id = ?1", params![cid])?;
    conn.execute("DELETE FROM client_sessions WHERE client_id = ?1", params![cid])?;
    Ok(())
}

pub fn delete_client(conn: &Connection, client_id: Uuid) -> RelayResult<()> {
    purge_device_state(conn, client_id)?;
    conn.execute("DELETE FROM clients WHERE client_id = ?1", params![client_id.to_string()])?;
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

    fn device(ip: &str) -> DeviceInfo {
        DeviceInfo {
            public_key: Some("pubkey".to_string()),
            registration_id: Some(1),
            ip: Some(ip.to_string()),
            browser: Some("firefox".to_string()),
            location: Some("nowhere".to_string()),
        }
    }

    #[test]
    fn find_or_create_assigns_sequential_device_ids() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let first = find_or_create_client(&conn, Uuid::new_v4(), owner, &device("1.1.1.1")).unwrap();
        let second = find_or_create_client(&conn, Uuid::new_v4(), owner, &device("2.2.2.2")).unwrap();
        assert_eq!(first.device_id, 1);
        assert_eq!(second.device_id, 2);

        let listed = list_for_owner(&conn, owner).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn find_or_create_updates_existing_device_for_same_owner() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        find_or_create_client(&conn, client_id, owner, &device("1.1.1.1")).unwrap();
        let updated = find_or_create_client(&conn, client_id, owner, &device("9.9.9.9")).unwrap();

        assert_eq!(updated.device_id, 1, "re-registering the same device keeps its device_id");
        assert_eq!(updated.ip.as_deref(), Some("9.9.9.9"));
        assert_eq!(list_for_owner(&conn, owner).unwrap().len(), 1);
    }

    #[test]
    fn find_or_create_purges_and_rebinds_on_ownership_transfer() {
        let conn = test_conn();
        let original_owner = Uuid::new_v4();
        let new_owner = Uuid::new_v4();
        let client_id = Uuid::new_v4();

        find_or_create_client(&conn, client_id, original_owner, &device("1.1.1.1")).unwrap();
        conn.execute(
            "INSERT INTO items (id, sender, sender_device, recipient, recipient_device, ciphertext, message_type, created_at)
             VALUES ('item-1', ?1, ?2, ?1, ?2, 'ct', 'text', '2024-01-01T00:00:00Z')",
            params![original_owner.to_string(), client_id.to_string()],
        )
        .unwrap();

        let rebound = find_or_create_client(&conn, client_id, new_owner, &device("2.2.2.2")).unwrap();
        assert_eq!(rebound.owner, new_owner);
        assert_eq!(rebound.device_id, 1, "new owner's first device");

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM items WHERE sender_device = ?1", params![client_id.to_string()], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0, "old device's envelopes must be purged before rebinding");
    }

    #[test]
    fn delete_client_removes_row_and_state() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        find_or_create_client(&conn, client_id, owner, &device("1.1.1.1")).unwrap();

        delete_client(&conn, client_id).unwrap();
        assert!(find_by_client_id(&conn, client_id).unwrap().is_none());
    }
}
