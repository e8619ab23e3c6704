//! Channel repository — E2EE messaging and WebRTC signaling rooms.

use chrono::Utc;
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::channel::{Channel, ChannelMember, ChannelType};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn type_to_str(t: ChannelType) -> &'static str {
    match t {
        ChannelType::Signal => "signal",
        ChannelType::Webrtc => "webrtc",
    }
}

fn type_from_str(s: &str) -> ChannelType {
    match s {
        "webrtc" => ChannelType::Webrtc,
        _ => ChannelType::Signal,
    }
}

fn row_to_channel(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        name: row.get(1)?,
        description: row.get(2)?,
        owner: row.get::<_, String>(3)?.parse().unwrap_or_default(),
        private: row.get::<_, i64>(4)? != 0,
        channel_type: type_from_str(&row.get::<_, String>(5)?),
        default_role_id: row.get::<_, Option<String>>(6)?.and_then(|s| s.parse().ok()),
        created_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(8)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_CHANNEL: &str =
    "SELECT id, name, description, owner, private, channel_type, default_role_id, created_at, updated_at FROM channels";

pub fn create_channel(
    conn: &Connection,
    owner: Uuid,
    name: &str,
    description: Option<&str>,
    channel_type: ChannelType,
    private: bool,
) -> RelayResult<Channel> {
    let id = meridian_common::id::generate_id();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO channels (id, name, description, owner, private, channel_type, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id.to_string(),
            name,
            description,
            owner.to_string(),
            private as i64,
            type_to_str(channel_type),
            now.to_rfc3339(),
        ],
    )?;
    conn.execute(
        "INSERT INTO channel_members (user_id, channel_id, joined_at) VALUES (?1, ?2, ?3)",
        params![owner.to_string(), id.to_string(), now.to_rfc3339()],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| RelayError::internal("channel vanished after insert"))
}

pub fn find_by_id(conn: &Connection, id: Uuid) -> RelayResult<Option<Channel>> {
    conn.query_row(&format!("{SELECT_CHANNEL} WHERE id = ?1"), params![id.to_string()], row_to_channel)
        .optional()
        .map_err(Into::into)
}

pub fn list_for_member(conn: &Connection, user_id: Uuid) -> RelayResult<Vec<Channel>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_CHANNEL} WHERE id IN (SELECT channel_id FROM channel_members WHERE user_id = ?1) ORDER BY created_at"
    ))?;
    let rows = stmt.query_map(params![user_id.to_string()], row_to_channel)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn delete_channel(conn: &Connection, id: Uuid) -> RelayResult<()> {
    conn.execute("DELETE FROM channel_members WHERE channel_id = ?1", params![id.to_string()])?;
    conn.execute("DELETE FROM sender_keys WHERE channel_id = ?1", params![id.to_string()])?;
    conn.execute("DELETE FROM channels WHERE id = ?1", params![id.to_string()])?;
    Ok(())
}

pub fn add_member(conn: &Connection, channel_id: Uuid, user_id: Uuid) -> RelayResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO channel_members (user_id, channel_id, joined_at) VALUES (?1, ?2, ?3)",
        params![user_id.to_string(), channel_id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn remove_member(conn: &Connection, channel_id: Uuid, user_id: Uuid) -> RelayResult<()> {
    conn.execute(
        "DELETE FROM channel_members WHERE user_id = ?1 AND channel_id = ?2",
        params![user_id.to_string(), channel_id.to_string()],
    )?;
    conn.execute(
        "DELETE FROM sender_keys WHERE channel_id = ?1 AND client_id IN (SELECT client_id FROM clients WHERE owner = ?2)",
        params![channel_id.to_string(), user_id.to_string()],
    )?;
    Ok(())
}

pub fn members(conn: &Connection, channel_id: Uuid) -> RelayResult<Vec<ChannelMember>> {
    let mut stmt = conn.prepare("SELECT user_id, channel_id, joined_at FROM channel_members WHERE channel_id = ?1")?;
    let rows = stmt.query_map(params![channel_id.to_string()], |row| {
        Ok(ChannelMember {
            user_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
            channel_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
            joined_at: row.get::<_, String>(2)?.parse().unwrap_or_else(|_| Utc::now()),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn is_member(conn: &Connection, channel_id: Uuid, user_id: Uuid) -> RelayResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
        params![channel_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
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
    fn create_channel_auto_adds_owner_as_member() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let channel = create_channel(&conn, owner, "general", None, ChannelType::Signal, false).unwrap();
        assert!(is_member(&conn, channel.id, owner).unwrap());
        assert_eq!(members(&conn, channel.id).unwrap().len(), 1);
    }

    #[test]
    fn add_and_remove_member() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let user = Uuid::new_v4();
        let channel = create_channel(&conn, owner, "general", None, ChannelType::Webrtc, true).unwrap();

        add_member(&conn, channel.id, user).unwrap();
        assert!(is_member(&conn, channel.id, user).unwrap());
        assert_eq!(members(&conn, channel.id).unwrap().len(), 2);

        remove_member(&conn, channel.id, user).unwrap();
        assert!(!is_member(&conn, channel.id, user).unwrap());
    }

    #[test]
    fn list_for_member_only_returns_channels_the_user_belongs_to() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        create_channel(&conn, owner, "general", None, ChannelType::Signal, false).unwrap();

        assert_eq!(list_for_member(&conn, owner).unwrap().len(), 1);
        assert_eq!(list_for_member(&conn, outsider).unwrap().len(), 0);
    }

    #[test]
    fn delete_channel_removes_memberships() {
        let conn = test_conn();
        let owner = Uuid::new_v4();
        let channel = create_channel(&conn, owner, "general", None, ChannelType::Signal, false).unwrap();

        delete_channel(&conn, channel.id).unwrap();
        assert!(find_by_id(&conn, channel.id).unwrap().is_none());
        assert_eq!(members(&conn, channel.id).unwrap().len(), 0);
    }
}
