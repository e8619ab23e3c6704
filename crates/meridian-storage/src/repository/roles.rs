//! Role repository — server and channel-scoped role definitions and assignments.

use chrono::Utc;
use meridian_common::error::{RelayError, RelayResult};
use meridian_common::models::role::{Role, UserRole, UserRoleChannel};
use meridian_common::permissions::RoleScope;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn scope_to_str(scope: RoleScope) -> &'static str {
    match scope {
        RoleScope::Server => "server",
        RoleScope::ChannelWebrtc => "channel_webrtc",
        RoleScope::ChannelSignal => "channel_signal",
    }
}

fn scope_from_str(s: &str) -> RoleScope {
    match s {
        "channel_webrtc" => RoleScope::ChannelWebrtc,
        "channel_signal" => RoleScope::ChannelSignal,
        _ => RoleScope::Server,
    }
}

fn row_to_role(row: &rusqlite::Row) -> rusqlite::Result<Role> {
    let permissions_json: String = row.get(3)?;
    Ok(Role {
        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        name: row.get(1)?,
        description: row.get(2)?,
        permissions: serde_json::from_str(&permissions_json).unwrap_or_default(),
        scope: scope_from_str(&row.get::<_, String>(4)?),
        standard: row.get::<_, i64>(5)? != 0,
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_ROLE: &str =
    "SELECT id, name, description, permissions, scope, standard, created_at, updated_at FROM roles";

pub fn create_role(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    permissions: &[String],
    scope: RoleScope,
    standard: bool,
) -> RelayResult<Role> {
    let id = meridian_common::id::generate_id();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO roles (id, name, description, permissions, scope, standard, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id.to_string(),
            name,
            description,
            serde_json::to_string(permissions).unwrap_or_default(),
            scope_to_str(scope),
            standard as i64,
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            RelayError::conflict(format!("role '{name}' already exists for this scope"))
        }
        other => RelayError::from(other),
    })?;
    find_by_id(conn, id)?.ok_or_else(|| RelayError::internal("role vanished after insert"))
}

pub fn find_by_id(conn: &Connection, id: Uuid) -> RelayResult<Option<Role>> {
    conn.query_row(&format!("{SELECT_ROLE} WHERE id = ?1"), params![id.to_string()], row_to_role)
        .optional()
        .map_err(Into::into)
}

pub fn list_by_scope(conn: &Connection, scope: RoleScope) -> RelayResult<Vec<Role>> {
    let mut stmt = conn.prepare(&format!("{SELECT_ROLE} WHERE scope = ?1 ORDER BY name"))?;
    let rows = stmt.query_map(params![scope_to_str(scope)], row_to_role)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn update_role(
    conn: &Connection,
    id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    permissions: Option<&[String]>,
) -> RelayResult<Role> {
    if let Some(role) = find_by_id(conn, id)? {
        if role.standard {
            return Err(RelayError::conflict("standard roles are immutable"));
        }
    } else {
        return Err(RelayError::not_found("role"));
    }
    conn.execute(
        "UPDATE roles SET
            name = COALESCE(?2, name),
            description = COALESCE(?3, description),
            permissions = COALESCE(?4, permissions),
            updated_at = ?5
         WHERE id = ?1",
        params![
            id.to_string(),
            name,
            description,
            permissions.map(|p| serde_json::to_string(p).unwrap_or_default()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| RelayError::internal("role vanished after update"))
}

pub fn delete_role(conn: &Connection, id: Uuid) -> RelayResult<()> {
    let role = find_by_id(conn, id)?.ok_or_else(|| RelayError::not_found("role"))?;
    if role.standard {
        return Err(RelayError::conflict("standard roles are undeletable"));
    }
    conn.execute("DELETE FROM roles WHERE id = ?1", params![id.to_string()])?;
    Ok(())
}

pub fn assign_server_role(conn: &Connection, user_id: Uuid, role_id: Uuid) -> RelayResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_roles (user_id, role_id, assigned_at) VALUES (?1, ?2, ?3)",
        params![user_id.to_string(), role_id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn assign_channel_role(conn: &Connection, user_id: Uuid, channel_id: Uuid, role_id: Uuid) -> RelayResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO user_role_channels (user_id, channel_id, role_id, assigned_at) VALUES (?1, ?2, ?3, ?4)",
        params![user_id.to_string(), channel_id.to_string(), role_id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn server_roles_for_user(conn: &Connection, user_id: Uuid) -> RelayResult<Vec<UserRole>> {
    let mut stmt = conn.prepare("SELECT user_id, role_id, assigned_at FROM user_roles WHERE user_id = ?1")?;
    let rows = stmt.query_map(params![user_id.to_string()], |row| {
        Ok(UserRole {
            user_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
            role_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
            assigned_at: row.get::<_, String>(2)?.parse().unwrap_or_else(|_| Utc::now()),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn channel_role_for_user(conn: &Connection, user_id: Uuid, channel_id: Uuid) -> RelayResult<Option<UserRoleChannel>> {
    conn.query_row(
        "SELECT user_id, channel_id, role_id, assigned_at FROM user_role_channels WHERE user_id = ?1 AND channel_id = ?2",
        params![user_id.to_string(), channel_id.to_string()],
        |row| {
            Ok(UserRoleChannel {
                user_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                channel_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                role_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
                assigned_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Idempotently seed the nine standard roles (server Administrator/Moderator/User,
/// plus the Channel Owner/Moderator/Member triad for each channel scope). Safe
/// to call on every startup; existing rows are left untouched.
pub fn seed_standard_roles(conn: &Connection) -> RelayResult<()> {
    use meridian_common::permissions::{STANDARD_CHANNEL_SIGNAL_ROLES, STANDARD_CHANNEL_WEBRTC_ROLES, STANDARD_SERVER_ROLES};

    let scopes: &[(&[(&str, &[&str])], RoleScope)] = &[
        (STANDARD_SERVER_ROLES, RoleScope::Server),
        (STANDARD_CHANNEL_WEBRTC_ROLES, RoleScope::ChannelWebrtc),
        (STANDARD_CHANNEL_SIGNAL_ROLES, RoleScope::ChannelSignal),
    ];

    for (roles, scope) in scopes {
        for (name, permissions) in *roles {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM roles WHERE name = ?1 AND scope = ?2",
                    params![name, scope_to_str(*scope)],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                continue;
            }
            let permissions: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
            create_role(conn, name, None, &permissions, *scope, true)?;
        }
    }
    Ok(())
}

/// Ensure `user_id` holds the named standard server role, assigning it if absent.
/// Used for auto-assignment on OTP success (`"User"`) and on every login of an
/// admin-listed email (`"Administrator"`).
pub fn ensure_server_role_assigned(conn: &Connection, user_id: Uuid, role_name: &str) -> RelayResult<()> {
    let role_id: Option<String> = conn
        .query_row(
            "SELECT id FROM roles WHERE name = ?1 AND scope = ?2",
            params![role_name, scope_to_str(RoleScope::Server)],
            |row| row.get(0),
        )
        .optional()?;
    let Some(role_id) = role_id else {
        return Err(RelayError::internal(format!("standard role '{role_name}' is not seeded")));
    };
    let role_id: Uuid = role_id.parse().map_err(|_| RelayError::internal("malformed role id"))?;
    assign_server_role(conn, user_id, role_id)
}

/// Permission set for `user_id` at server scope (union across assigned roles).
pub fn server_permissions_for_user(conn: &Connection, user_id: Uuid) -> RelayResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT r.permissions FROM roles r
         JOIN user_roles ur ON ur.role_id = r.id
         WHERE ur.user_id = ?1",
    )?;
    let rows = stmt.query_map(params![user_id.to_string()], |row| row.get::<_, String>(0))?;
    let mut perms = Vec::new();
    for json in rows {
        let list: Vec<String> = serde_json::from_str(&json?).unwrap_or_default();
        perms.extend(list);
    }
    Ok(perms)
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
    fn create_and_find_role_round_trip() {
        let conn = test_conn();
        let role = create_role(&conn, "Custom", Some("a custom role"), &["room.join".to_string()], RoleScope::Server, false).unwrap();
        let found = find_by_id(&conn, role.id).unwrap().unwrap();
        assert_eq!(found.name, "Custom");
        assert_eq!(found.permissions, vec!["room.join".to_string()]);
        assert!(!found.standard);
    }

    #[test]
    fn create_role_rejects_duplicate_name_in_same_scope() {
        let conn = test_conn();
        create_role(&conn, "Custom", None, &[], RoleScope::Server, false).unwrap();
        let err = create_role(&conn, "Custom", None, &[], RoleScope::Server, false).unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));

        // Same name, different scope is fine.
        create_role(&conn, "Custom", None, &[], RoleScope::ChannelWebrtc, false).unwrap();
    }

    #[test]
    fn update_and_delete_refuse_standard_roles() {
        let conn = test_conn();
        let standard = create_role(&conn, "Channel Owner", None, &[], RoleScope::ChannelWebrtc, true).unwrap();

        let err = update_role(&conn, standard.id, Some("renamed"), None, None).unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));

        let err = delete_role(&conn, standard.id).unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));

        let custom = create_role(&conn, "Custom", None, &[], RoleScope::ChannelWebrtc, false).unwrap();
        let updated = update_role(&conn, custom.id, Some("Renamed"), None, None).unwrap();
        assert_eq!(updated.name, "Renamed");
        delete_role(&conn, custom.id).unwrap();
        assert!(find_by_id(&conn, custom.id).unwrap().is_none());
    }

    #[test]
    fn server_role_assignment_is_idempotent_and_listable() {
        let conn = test_conn();
        let role = create_role(&conn, "User", None, &["envelope.send".to_string()], RoleScope::Server, true).unwrap();
        let user_id = Uuid::new_v4();

        assign_server_role(&conn, user_id, role.id).unwrap();
        assign_server_role(&conn, user_id, role.id).unwrap();

        let assigned = server_roles_for_user(&conn, user_id).unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].role_id, role.id);

        let perms = server_permissions_for_user(&conn, user_id).unwrap();
        assert_eq!(perms, vec!["envelope.send".to_string()]);
    }

    #[test]
    fn channel_role_assignment_replaces_existing() {
        let conn = test_conn();
        let member = create_role(&conn, "Channel Member", None, &[], RoleScope::ChannelWebrtc, true).unwrap();
        let moderator = create_role(&conn, "Channel Moderator", None, &[], RoleScope::ChannelWebrtc, true).unwrap();
        let user_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();

        assign_channel_role(&conn, user_id, channel_id, member.id).unwrap();
        assign_channel_role(&conn, user_id, channel_id, moderator.id).unwrap();

        let assigned = channel_role_for_user(&conn, user_id, channel_id).unwrap().unwrap();
        assert_eq!(assigned.role_id, moderator.id);
    }

    #[test]
    fn seed_standard_roles_is_idempotent() {
        let conn = test_conn();
        seed_standard_roles(&conn).unwrap();
        seed_standard_roles(&conn).unwrap();

        let server_roles = list_by_scope(&conn, RoleScope::Server).unwrap();
        assert_eq!(server_roles.len(), 3);
        let webrtc_roles = list_by_scope(&conn, RoleScope::ChannelWebrtc).unwrap();
        assert_eq!(webrtc_roles.len(), 3);
        let signal_roles = list_by_scope(&conn, RoleScope::ChannelSignal).unwrap();
        assert_eq!(signal_roles.len(), 3);
    }

    #[test]
    fn ensure_server_role_assigned_requires_seeding() {
        let conn = test_conn();
        let user_id = Uuid::new_v4();
        let err = ensure_server_role_assigned(&conn, user_id, "User").unwrap_err();
        assert!(matches!(err, RelayError::Internal(_)));

        seed_standard_roles(&conn).unwrap();
        ensure_server_role_assigned(&conn, user_id, "User").unwrap();
        let perms = server_permissions_for_user(&conn, user_id).unwrap();
        assert!(perms.contains(&"envelope.send".to_string()));
    }
}
