//! Envelope Store repository (C6) — 1:1 and group encrypted message queues.
//!
//! `items` holds 1:1 envelopes addressed to exactly one `(recipient,
//! recipient_device)` pair. `group_items` holds one row per channel send
//! regardless of recipient count — the row IS the fan-out unit, and
//! `group_item_reads` tracks per-recipient read receipts against it.

use chrono::Utc;
use meridian_common::error::RelayResult;
use meridian_common::models::envelope::{GroupItem, Item};
use rusqlite::{params, Connection};
use uuid::Uuid;

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        recipient: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        recipient_device: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        sender: row.get::<_, String>(3)?.parse().unwrap_or_default(),
        sender_device: row.get::<_, String>(4)?.parse().unwrap_or_default(),
        ciphertext: row.get(5)?,
        message_type: row.get(6)?,
        created_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

/// Send a 1:1 envelope. `item_id` is client-provided for idempotent dedup —
/// a second send with the same `(item_id, recipient, recipient_device)` is a
/// no-op and returns the original row.
pub fn send_item(
    conn: &Connection,
    item_id: Uuid,
    recipient: Uuid,
    recipient_device: Uuid,
    sender: Uuid,
    sender_device: Uuid,
    ciphertext: &str,
    message_type: &str,
) -> RelayResult<Item> {
    conn.execute(
        "INSERT OR IGNORE INTO items (id, recipient, recipient_device, sender, sender_device, ciphertext, message_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            item_id.to_string(),
            recipient.to_string(),
            recipient_device.to_string(),
            sender.to_string(),
            sender_device.to_string(),
            ciphertext,
            message_type,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.query_row(
        "SELECT id, recipient, recipient_device, sender, sender_device, ciphertext, message_type, created_at
         FROM items WHERE id = ?1",
        params![item_id.to_string()],
        row_to_item,
    )?)
}

/// Fetch all pending items for `(recipient, recipient_device)`, oldest first.
pub fn fetch_items(conn: &Connection, recipient: Uuid, recipient_device: Uuid) -> RelayResult<Vec<Item>> {
    let mut stmt = conn.prepare(
        "SELECT id, recipient, recipient_device, sender, sender_device, ciphertext, message_type, created_at
         FROM items WHERE recipient = ?1 AND recipient_device = ?2 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![recipient.to_string(), recipient_device.to_string()], row_to_item)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Delete an item once the client has confirmed delivery/read.
pub fn ack_item(conn: &Connection, item_id: Uuid) -> RelayResult<()> {
    conn.execute("DELETE FROM items WHERE id = ?1", params![item_id.to_string()])?;
    Ok(())
}

/// Purge items older than `retention` — the housekeeping sweep's cadence.
pub fn purge_delivered_older_than(conn: &Connection, cutoff: chrono::DateTime<Utc>) -> RelayResult<usize> {
    Ok(conn.execute("DELETE FROM items WHERE created_at < ?1", params![cutoff.to_rfc3339()])?)
}

fn row_to_group_item(row: &rusqlite::Row) -> rusqlite::Result<GroupItem> {
    Ok(GroupItem {
        item_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        channel_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        sender: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        sender_device: row.get::<_, String>(3)?.parse().unwrap_or_default(),
        ciphertext: row.get(4)?,
        message_type: row.get(5)?,
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

/// Send a group message: exactly one `group_items` row regardless of how
/// many members the channel has, since the ciphertext is the same for all of
/// them. `item_id` is client-provided so a retried send is idempotent.
pub fn send_group_item(
    conn: &Connection,
    item_id: Uuid,
    channel_id: Uuid,
    sender: Uuid,
    sender_device: Uuid,
    ciphertext: &str,
    message_type: &str,
) -> RelayResult<GroupItem> {
    conn.execute(
        "INSERT OR IGNORE INTO group_items (item_id, channel_id, sender, sender_device, ciphertext, message_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item_id.to_string(),
            channel_id.to_string(),
            sender.to_string(),
            sender_device.to_string(),
            ciphertext,
            message_type,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.query_row(
        "SELECT item_id, channel_id, sender, sender_device, ciphertext, message_type, created_at
         FROM group_items WHERE item_id = ?1",
        params![item_id.to_string()],
        row_to_group_item,
    )?)
}

/// Items sent to `channel_id` after `since`, oldest first, skipping anything
/// sent by someone `requesting_user` has blocked.
pub fn fetch_group_items(
    conn: &Connection,
    channel_id: Uuid,
    requesting_user: Uuid,
    since: chrono::DateTime<Utc>,
) -> RelayResult<Vec<GroupItem>> {
    let mut stmt = conn.prepare(
        "SELECT item_id, channel_id, sender, sender_device, ciphertext, message_type, created_at
         FROM group_items WHERE channel_id = ?1 AND created_at > ?2 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![channel_id.to_string(), since.to_rfc3339()], row_to_group_item)?;
    let mut items = Vec::new();
    for item in rows {
        let item = item?;
        if !crate::repository::abuse::is_blocked(conn, requesting_user, item.sender)? {
            items.push(item);
        }
    }
    Ok(items)
}

/// Mark `item_id` read by `(user_id, device_id)`. Unique per device — the
/// same message read from three devices produces three rows.
pub fn mark_group_item_read(conn: &Connection, item_id: Uuid, user_id: Uuid, device_id: Uuid) -> RelayResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO group_item_reads (item_id, user_id, device_id, read_at) VALUES (?1, ?2, ?3, ?4)",
        params![item_id.to_string(), user_id.to_string(), device_id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn group_item_read_count(conn: &Connection, item_id: Uuid) -> RelayResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM group_item_reads WHERE item_id = ?1",
        params![item_id.to_string()],
        |row| row.get(0),
    )?)
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
    fn send_item_is_idempotent_per_item_id() {
        let conn = test_conn();
        let item_id = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let recipient_device = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let sender_device = Uuid::new_v4();

        let first = send_item(&conn, item_id, recipient, recipient_device, sender, sender_device, "ct-1", "text").unwrap();
        let replay = send_item(&conn, item_id, recipient, recipient_device, sender, sender_device, "ct-2", "text").unwrap();

        assert_eq!(first.ciphertext, replay.ciphertext, "replay returns the original row, not the new ciphertext");
        assert_eq!(fetch_items(&conn, recipient, recipient_device).unwrap().len(), 1);
    }

    #[test]
    fn fetch_items_orders_oldest_first_and_ack_removes() {
        let conn = test_conn();
        let recipient = Uuid::new_v4();
        let recipient_device = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let sender_device = Uuid::new_v4();

        let first = send_item(&conn, Uuid::new_v4(), recipient, recipient_device, sender, sender_device, "first", "text").unwrap();
        let _second = send_item(&conn, Uuid::new_v4(), recipient, recipient_device, sender, sender_device, "second", "text").unwrap();

        let pending = fetch_items(&conn, recipient, recipient_device).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].ciphertext, "first");

        ack_item(&conn, first.id).unwrap();
        let remaining = fetch_items(&conn, recipient, recipient_device).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ciphertext, "second");
    }

    #[test]
    fn purge_delivered_older_than_only_removes_stale_rows() {
        let conn = test_conn();
        let recipient = Uuid::new_v4();
        let recipient_device = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let sender_device = Uuid::new_v4();
        let item_id = Uuid::new_v4();

        send_item(&conn, item_id, recipient, recipient_device, sender, sender_device, "old", "text").unwrap();
        conn.execute(
            "UPDATE items SET created_at = '2000-01-01T00:00:00Z' WHERE id = ?1",
            params![item_id.to_string()],
        )
        .unwrap();
        send_item(&conn, Uuid::new_v4(), recipient, recipient_device, sender, sender_device, "new", "text").unwrap();

        let purged = purge_delivered_older_than(&conn, Utc::now() - chrono::Duration::days(1)).unwrap();
        assert_eq!(purged, 1);
        let remaining = fetch_items(&conn, recipient, recipient_device).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ciphertext, "new");
    }

    #[test]
    fn send_group_item_is_one_row_regardless_of_member_count() {
        let conn = test_conn();
        let item_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let sender_device = Uuid::new_v4();

        let first = send_group_item(&conn, item_id, channel_id, sender, sender_device, "ct-1", "text").unwrap();
        let replay = send_group_item(&conn, item_id, channel_id, sender, sender_device, "ct-2", "text").unwrap();

        assert_eq!(first.ciphertext, replay.ciphertext, "replay returns the original row");
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM group_items WHERE channel_id = ?1", params![channel_id.to_string()], |r| r.get(0)).unwrap();
        assert_eq!(count, 1, "one row regardless of how many members the channel has");
    }

    #[test]
    fn fetch_group_items_filters_blocked_senders_and_respects_since() {
        let conn = test_conn();
        let channel_id = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let blocked_sender = Uuid::new_v4();
        let sender_device = Uuid::new_v4();
        let viewer = Uuid::new_v4();

        let epoch = chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        send_group_item(&conn, Uuid::new_v4(), channel_id, sender, sender_device, "visible", "text").unwrap();
        send_group_item(&conn, Uuid::new_v4(), channel_id, blocked_sender, sender_device, "hidden", "text").unwrap();
        crate::repository::abuse::block(&conn, viewer, blocked_sender).unwrap();

        let items = fetch_group_items(&conn, channel_id, viewer, epoch).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].ciphertext, "visible");

        let none_since_now = fetch_group_items(&conn, channel_id, viewer, Utc::now()).unwrap();
        assert!(none_since_now.is_empty());
    }

    #[test]
    fn group_item_read_is_per_device() {
        let conn = test_conn();
        let item_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let sender_device = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let device_a = Uuid::new_v4();
        let device_b = Uuid::new_v4();

        send_group_item(&conn, item_id, channel_id, sender, sender_device, "ct", "text").unwrap();

        mark_group_item_read(&conn, item_id, reader, device_a).unwrap();
        mark_group_item_read(&conn, item_id, reader, device_a).unwrap();
        assert_eq!(group_item_read_count(&conn, item_id).unwrap(), 1, "re-reading from the same device is a no-op");

        mark_group_item_read(&conn, item_id, reader, device_b).unwrap();
        assert_eq!(group_item_read_count(&conn, item_id).unwrap(), 2, "a second device produces a second row");
    }
}
