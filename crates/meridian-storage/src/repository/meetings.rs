//! Meeting Coordinator repository (C8) — persistent meeting metadata, RSVPs,
//! and reusable invitation tokens. `ExternalSession` (the guest admission
//! state) is volatile and lives in [`crate::memory::MemoryStore`] instead.

use chrono::Utc;
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::meeting::{InvitationToken, Meeting, MeetingRsvp, RsvpCounts, RsvpStatus};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn status_to_str(s: RsvpStatus) -> &'static str {
    match s {
        RsvpStatus::Invited => "invited",
        RsvpStatus::Accepted => "accepted",
        RsvpStatus::Declined => "declined",
        RsvpStatus::Tentative => "tentative",
    }
}

fn status_from_str(s: &str) -> RsvpStatus {
    match s {
        "accepted" => RsvpStatus::Accepted,
        "declined" => RsvpStatus::Declined,
        "tentative" => RsvpStatus::Tentative,
        _ => RsvpStatus::Invited,
    }
}

fn row_to_meeting(row: &rusqlite::Row) -> rusqlite::Result<Meeting> {
    Ok(Meeting {
        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        room_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        organizer: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        meeting_name: row.get(3)?,
        meeting_description: row.get(4)?,
        instant_meeting: row.get::<_, i64>(5)? != 0,
        scheduled_meeting: row.get::<_, i64>(6)? != 0,
        meeting_date: row.get::<_, Option<String>>(7)?.and_then(|s| s.parse().ok()),
        voice_only: row.get::<_, i64>(8)? != 0,
        enable_chat: row.get::<_, i64>(9)? != 0,
        enable_recording: row.get::<_, i64>(10)? != 0,
        muted: row.get::<_, i64>(11)? != 0,
        camera_off: row.get::<_, i64>(12)? != 0,
        max_cam_resolution: row.get(13)?,
        created_at: row.get::<_, String>(14)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(15)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_MEETING: &str = "SELECT id, room_id, organizer, meeting_name, meeting_description, instant_meeting,
    scheduled_meeting, meeting_date, voice_only, enable_chat, enable_recording, muted, camera_off,
    max_cam_resolution, created_at, updated_at FROM meetings";

#[allow(clippy::too_many_arguments)]
pub fn create_meeting(
    conn: &Connection,
    organizer: Uuid,
    meeting_name: &str,
    meeting_description: Option<&str>,
    instant_meeting: bool,
    scheduled_meeting: bool,
    meeting_date: Option<chrono::DateTime<Utc>>,
    voice_only: bool,
    enable_chat: bool,
    enable_recording: bool,
    muted: bool,
    camera_off: bool,
    max_cam_resolution: Option<&str>,
) -> RelayResult<Meeting> {
    let id = meridian_common::id::generate_id();
    let room_id = meridian_common::id::generate_id();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO meetings (id, room_id, organizer, meeting_name, meeting_description, instant_meeting,
            scheduled_meeting, meeting_date, voice_only, enable_chat, enable_recording, muted, camera_off,
            max_cam_resolution, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?15)",
        params![
            id.to_string(),
            room_id.to_string(),
            organizer.to_string(),
            meeting_name,
            meeting_description,
            instant_meeting as i64,
            scheduled_meeting as i64,
            meeting_date.map(|d| d.to_rfc3339()),
            voice_only as i64,
            enable_chat as i64,
            enable_recording as i64,
            muted as i64,
            camera_off as i64,
            max_cam_resolution,
            now.to_rfc3339(),
        ],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| RelayError::internal("meeting vanished after insert"))
}

pub fn find_by_id(conn: &Connection, id: Uuid) -> RelayResult<Option<Meeting>> {
    conn.query_row(&format!("{SELECT_MEETING} WHERE id = ?1"), params![id.to_string()], row_to_meeting)
        .optional()
        .map_err(Into::into)
}

pub fn find_by_room_id(conn: &Connection, room_id: Uuid) -> RelayResult<Option<Meeting>> {
    conn.query_row(&format!("{SELECT_MEETING} WHERE room_id = ?1"), params![room_id.to_string()], row_to_meeting)
        .optional()
        .map_err(Into::into)
}

pub fn invite_participant(conn: &Connection, meeting_id: Uuid, invitee: Uuid) -> RelayResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO meeting_invitations (meeting_id, invitee, invited_at) VALUES (?1, ?2, ?3)",
        params![meeting_id.to_string(), invitee.to_string(), Utc::now().to_rfc3339()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meeting_rsvps (meeting_id, user_id, status, updated_at) VALUES (?1, ?2, 'invited', ?3)",
        params![meeting_id.to_string(), invitee.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn is_invited(conn: &Connection, meeting_id: Uuid, user_id: Uuid) -> RelayResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM meeting_invitations WHERE meeting_id = ?1 AND invitee = ?2",
        params![meeting_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn set_rsvp(conn: &Connection, meeting_id: Uuid, user_id: Uuid, status: RsvpStatus) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO meeting_rsvps (meeting_id, user_id, status, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (meeting_id, user_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        params![meeting_id.to_string(), user_id.to_string(), status_to_str(status), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn rsvp_counts(conn: &Connection, meeting_id: Uuid) -> RelayResult<RsvpCounts> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM meeting_rsvps WHERE meeting_id = ?1 GROUP BY status")?;
    let rows = stmt.query_map(params![meeting_id.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut counts = RsvpCounts { invited: 0, accepted: 0, declined: 0, tentative: 0 };
    for row in rows {
        let (status, n) = row?;
        match status_from_str(&status) {
            RsvpStatus::Invited => counts.invited = n,
            RsvpStatus::Accepted => counts.accepted = n,
            RsvpStatus::Declined => counts.declined = n,
            RsvpStatus::Tentative => counts.tentative = n,
        }
    }
    Ok(counts)
}

pub fn list_rsvps(conn: &Connection, meeting_id: Uuid) -> RelayResult<Vec<MeetingRsvp>> {
    let mut stmt = conn.prepare("SELECT meeting_id, user_id, status, updated_at FROM meeting_rsvps WHERE meeting_id = ?1")?;
    let rows = stmt.query_map(params![meeting_id.to_string()], |row| {
        Ok(MeetingRsvp {
            meeting_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
            user_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
            status: status_from_str(&row.get::<_, String>(2)?),
            updated_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

// --- Invitation tokens (reusable guest links, distinct from signup Invitation) ---

fn row_to_invitation_token(row: &rusqlite::Row) -> rusqlite::Result<InvitationToken> {
    Ok(InvitationToken {
        token: row.get(0)?,
        meeting_id: row.get::<_, Option<String>>(1)?.and_then(|s| s.parse().ok()),
        label: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        expires_at: row.get::<_, Option<String>>(4)?.and_then(|s| s.parse().ok()),
        max_uses: row.get(5)?,
        use_count: row.get(6)?,
        created_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_TOKEN: &str =
    "SELECT token, meeting_id, label, is_active, expires_at, max_uses, use_count, created_at FROM invitation_tokens";

pub fn create_invitation_token(
    conn: &Connection,
    meeting_id: Option<Uuid>,
    label: Option<&str>,
    expires_at: Option<chrono::DateTime<Utc>>,
    max_uses: Option<i64>,
) -> RelayResult<InvitationToken> {
    let token = crate::random_token(6);
    conn.execute(
        "INSERT INTO invitation_tokens (token, meeting_id, label, is_active, expires_at, max_uses, use_count, created_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, 0, ?6)",
        params![
            token,
            meeting_id.map(|m| m.to_string()),
            label,
            expires_at.map(|e| e.to_rfc3339()),
            max_uses,
            Utc::now().to_rfc3339(),
        ],
    )?;
    find_invitation_token(conn, &token)?.ok_or_else(|| RelayError::internal("invitation token vanished after insert"))
}

pub fn find_invitation_token(conn: &Connection, token: &str) -> RelayResult<Option<InvitationToken>> {
    conn.query_row(&format!("{SELECT_TOKEN} WHERE token = ?1"), params![token], row_to_invitation_token)
        .optional()
        .map_err(Into::into)
}

/// Atomically validate and consume one use of an invitation token:
/// `is_active && (expires_at IS NULL OR expires_at > now) && (max_uses IS NULL OR use_count < max_uses)`,
/// then increment `use_count`. Must run inside the single-writer gateway.
pub fn consume_invitation_token(conn: &Connection, token: &str) -> RelayResult<InvitationToken> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE invitation_tokens SET use_count = use_count + 1
         WHERE token = ?1 AND is_active = 1
           AND (expires_at IS NULL OR expires_at > ?2)
           AND (max_uses IS NULL OR use_count < max_uses)",
        params![token, now],
    )?;
    if changed == 0 {
        return Err(RelayError::validation("invitation token is invalid, expired, or exhausted"));
    }
    find_invitation_token(conn, token)?.ok_or_else(|| RelayError::internal("invitation token vanished after consume"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../schema.sql")).unwrap();
        conn
    }

    fn new_meeting(conn: &Connection, organizer: Uuid) -> Meeting {
        create_meeting(conn, organizer, "standup", None, true, false, None, false, true, false, false, false, None).unwrap()
    }

    #[test]
    fn create_meeting_is_findable_by_id_and_room_id() {
        let conn = test_conn();
        let organizer = Uuid::new_v4();
        let meeting = new_meeting(&conn, organizer);

        assert_eq!(find_by_id(&conn, meeting.id).unwrap().unwrap().room_id, meeting.room_id);
        assert_eq!(find_by_room_id(&conn, meeting.room_id).unwrap().unwrap().id, meeting.id);
    }

    #[test]
    fn invite_participant_sets_invited_rsvp() {
        let conn = test_conn();
        let organizer = Uuid::new_v4();
        let invitee = Uuid::new_v4();
        let meeting = new_meeting(&conn, organizer);

        assert!(!is_invited(&conn, meeting.id, invitee).unwrap());
        invite_participant(&conn, meeting.id, invitee).unwrap();
        assert!(is_invited(&conn, meeting.id, invitee).unwrap());

        let counts = rsvp_counts(&conn, meeting.id).unwrap();
        assert_eq!(counts.invited, 1);
        assert_eq!(counts.accepted, 0);
    }

    #[test]
    fn set_rsvp_upserts_and_counts_update() {
        let conn = test_conn();
        let organizer = Uuid::new_v4();
        let invitee = Uuid::new_v4();
        let meeting = new_meeting(&conn, organizer);
        invite_participant(&conn, meeting.id, invitee).unwrap();

        set_rsvp(&conn, meeting.id, invitee, RsvpStatus::Accepted).unwrap();
        let counts = rsvp_counts(&conn, meeting.id).unwrap();
        assert_eq!(counts.invited, 0);
        assert_eq!(counts.accepted, 1);

        let rsvps = list_rsvps(&conn, meeting.id).unwrap();
        assert_eq!(rsvps.len(), 1);
        assert!(matches!(rsvps[0].status, RsvpStatus::Accepted));
    }

    #[test]
    fn invitation_token_consume_enforces_max_uses() {
        let conn = test_conn();
        let meeting = new_meeting(&conn, Uuid::new_v4());
        let token = create_invitation_token(&conn, Some(meeting.id), Some("guest link"), None, Some(1)).unwrap();

        let consumed = consume_invitation_token(&conn, &token.token).unwrap();
        assert_eq!(consumed.use_count, 1);

        let err = consume_invitation_token(&conn, &token.token).unwrap_err();
        assert!(matches!(err, RelayError::ValidationFail { .. }));
    }

    #[test]
    fn invitation_token_consume_enforces_expiry() {
        let conn = test_conn();
        let expired = create_invitation_token(&conn, None, None, Some(Utc::now() - chrono::Duration::hours(1)), None).unwrap();
        let err = consume_invitation_token(&conn, &expired.token).unwrap_err();
        assert!(matches!(err, RelayError::ValidationFail { .. }));

        let fresh = create_invitation_token(&conn, None, None, Some(Utc::now() + chrono::Duration::hours(1)), None).unwrap();
        consume_invitation_token(&conn, &fresh.token).unwrap();
    }

    #[test]
    fn invitation_token_consume_rejects_deactivated_token() {
        let conn = test_conn();
        let token = create_invitation_token(&conn, None, None, None, None).unwrap();
        conn.execute("UPDATE invitation_tokens SET is_active = 0 WHERE token = ?1", params![token.token]).unwrap();
        let err = consume_invitation_token(&conn, &token.token).unwrap_err();
        assert!(matches!(err, RelayError::ValidationFail { .. }));
    }
}
