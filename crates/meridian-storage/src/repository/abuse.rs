//! Abuse & Blocking repository (C9).
//!
//! Blocks are one-directional: only the blocker's view is filtered, in both
//! the envelope path (C6) and the signaling hub fan-out (C7).

use chrono::Utc;
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::abuse::{AbuseReport, ReportStatus};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub fn block(conn: &Connection, blocker: Uuid, blocked: Uuid) -> RelayResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO blocked_users (blocker, blocked, created_at) VALUES (?1, ?2, ?3)",
        params![blocker.to_string(), blocked.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn unblock(conn: &Connection, blocker: Uuid, blocked: Uuid) -> RelayResult<()> {
    conn.execute(
        "DELETE FROM blocked_users WHERE blocker = ?1 AND blocked = ?2",
        params![blocker.to_string(), blocked.to_string()],
    )?;
    Ok(())
}

pub fn is_blocked(conn: &Connection, blocker: Uuid, blocked: Uuid) -> RelayResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocked_users WHERE blocker = ?1 AND blocked = ?2",
        params![blocker.to_string(), blocked.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list_blocked(conn: &Connection, blocker: Uuid) -> RelayResult<Vec<Uuid>> {
    let mut stmt = conn.prepare("SELECT blocked FROM blocked_users WHERE blocker = ?1")?;
    let rows = stmt.query_map(params![blocker.to_string()], |row| row.get::<_, String>(0))?;
    Ok(rows
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter_map(|s| s.parse().ok())
        .collect())
}

fn row_to_report(row: &rusqlite::Row) -> rusqlite::Result<AbuseReport> {
    let photos_json: String = row.get(4)?;
    Ok(AbuseReport {
        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        reporter: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        reported: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        description: row.get(3)?,
        photos: serde_json::from_str(&photos_json).unwrap_or_default(),
        status: status_from_str(&row.get::<_, String>(5)?),
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
        resolved_at: row.get::<_, Option<String>>(7)?.and_then(|s| s.parse().ok()),
    })
}

fn status_to_str(s: ReportStatus) -> &'static str {
    match s {
        ReportStatus::Pending => "pending",
        ReportStatus::UnderReview => "under_review",
        ReportStatus::Resolved => "resolved",
        ReportStatus::Dismissed => "dismissed",
    }
}

fn status_from_str(s: &str) -> ReportStatus {
    match s {
        "under_review" => ReportStatus::UnderReview,
        "resolved" => ReportStatus::Resolved,
        "dismissed" => ReportStatus::Dismissed,
        _ => ReportStatus::Pending,
    }
}

pub fn create_report(
    conn: &Connection,
    reporter: Uuid,
    reported: Uuid,
    description: &str,
    photos: &[String],
) -> RelayResult<AbuseReport> {
    let id = meridian_common::id::generate_id();
    conn.execute(
        "INSERT INTO abuse_reports (id, reporter, reported, description, photos, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        params![
            id.to_string(),
            reporter.to_string(),
            reported.to_string(),
            description,
            serde_json::to_string(photos).unwrap_or_default(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    find_report(conn, id)?.ok_or_else(|| RelayError::internal("abuse report vanished after insert"))
}

pub fn find_report(conn: &Connection, id: Uuid) -> RelayResult<Option<AbuseReport>> {
    conn.query_row(
        "SELECT id, reporter, reported, description, photos, status, created_at, resolved_at
         FROM abuse_reports WHERE id = ?1",
        params![id.to_string()],
        row_to_report,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_reports_by_status(conn: &Connection, status: ReportStatus) -> RelayResult<Vec<AbuseReport>> {
    let mut stmt = conn.prepare(
        "SELECT id, reporter, reported, description, photos, status, created_at, resolved_at
         FROM abuse_reports WHERE status = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![status_to_str(status)], row_to_report)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn resolve_report(conn: &Connection, id: Uuid, status: ReportStatus) -> RelayResult<()> {
    conn.execute(
        "UPDATE abuse_reports SET status = ?2, resolved_at = ?3 WHERE id = ?1",
        params![id.to_string(), status_to_str(status), Utc::now().to_rfc3339()],
    )?;
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

    #[test]
    fn block_is_one_directional() {
        let conn = test_conn();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        block(&conn, alice, bob).unwrap();

        assert!(is_blocked(&conn, alice, bob).unwrap());
        assert!(!is_blocked(&conn, bob, alice).unwrap(), "blocking is one-directional");
    }

    #[test]
    fn block_is_idempotent_and_unblock_removes_it() {
        let conn = test_conn();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        block(&conn, alice, bob).unwrap();
        block(&conn, alice, bob).unwrap();
        assert_eq!(list_blocked(&conn, alice).unwrap(), vec![bob]);

        unblock(&conn, alice, bob).unwrap();
        assert!(!is_blocked(&conn, alice, bob).unwrap());
        assert!(list_blocked(&conn, alice).unwrap().is_empty());
    }

    #[test]
    fn create_report_defaults_to_pending_and_resolve_updates_status() {
        let conn = test_conn();
        let reporter = Uuid::new_v4();
        let reported = Uuid::new_v4();
        let report = create_report(&conn, reporter, reported, "harassment", &["photo1".to_string()]).unwrap();
        assert!(matches!(report.status, ReportStatus::Pending));
        assert!(report.resolved_at.is_none());

        let pending = list_reports_by_status(&conn, ReportStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, report.id);

        resolve_report(&conn, report.id, ReportStatus::Resolved).unwrap();
        let resolved = find_report(&conn, report.id).unwrap().unwrap();
        assert!(matches!(resolved.status, ReportStatus::Resolved));
        assert!(resolved.resolved_at.is_some());
        assert!(list_reports_by_status(&conn, ReportStatus::Pending).unwrap().is_empty());
    }
}
