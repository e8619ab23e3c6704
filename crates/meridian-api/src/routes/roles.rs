//! Role routes (C4) — server and channel-scoped role CRUD plus assignment.
//!
//! Standard roles (`Administrator`/`Moderator`/`User` at server scope, the
//! `Channel Owner`/`Moderator`/`Member` triads at channel scope) are seeded
//! at startup and rejected by `update_role`/`delete_role` in the repository
//! layer; this file just surfaces that rejection as a normal error response.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use meridian_common::{
    error::{RelayError, RelayResult},
    models::role::{AssignRoleRequest, CreateRoleRequest, Role, UpdateRoleRequest},
    permissions::{PermissionSet, RoleScope},
    validation::validate_request,
};
use meridian_storage::repository::roles;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/{role_id}", get(get_role).patch(update_role).delete(delete_role))
        .route("/roles/{role_id}/assign", post(assign_server_role))
        .route("/channels/{channel_id}/roles/{role_id}/assign", post(assign_channel_role))
}

#[derive(Debug, Deserialize)]
struct ScopeQuery {
    scope: Option<RoleScope>,
}

fn require_role_manage(conn: &rusqlite::Connection, user_id: Uuid) -> RelayResult<()> {
    let perms = roles::server_permissions_for_user(conn, user_id)?;
    if !PermissionSet::from_iter(perms).has("role.manage") {
        return Err(RelayError::permission_denied("role.manage"));
    }
    Ok(())
}

/// GET /api/v1/roles?scope=server — defaults to server scope.
async fn list_roles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScopeQuery>,
) -> RelayResult<Json<Vec<Role>>> {
    let conn = state.storage.db.read()?;
    Ok(Json(roles::list_by_scope(&conn, query.scope.unwrap_or(RoleScope::Server))?))
}

async fn get_role(State(state): State<Arc<AppState>>, Path(role_id): Path<Uuid>) -> RelayResult<Json<Role>> {
    let conn = state.storage.db.read()?;
    roles::find_by_id(&conn, role_id)?.map(Json).ok_or_else(|| RelayError::not_found("role"))
}

/// POST /api/v1/roles — custom roles only; standard roles are seeded at startup.
async fn create_role(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRoleRequest>,
) -> RelayResult<Json<Role>> {
    let user_id = auth.require_user()?;
    validate_request(&body)?;

    let role = state
        .storage
        .db
        .write("create_role", move |conn| {
            require_role_manage(conn, user_id)?;
            roles::create_role(conn, &body.name, body.description.as_deref(), &body.permissions, body.scope, false)
        })
        .await?;

    Ok(Json(role))
}

async fn update_role(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<Uuid>,
    Json(body): Json<UpdateRoleRequest>,
) -> RelayResult<Json<Role>> {
    let user_id = auth.require_user()?;
    validate_request(&body)?;

    let role = state
        .storage
        .db
        .write("update_role", move |conn| {
            require_role_manage(conn, user_id)?;
            roles::update_role(conn, role_id, body.name.as_deref(), body.description.as_deref(), body.permissions.as_deref())
        })
        .await?;

    Ok(Json(role))
}

async fn delete_role(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    state
        .storage
        .db
        .write("delete_role", move |conn| {
            require_role_manage(conn, user_id)?;
            roles::delete_role(conn, role_id)
        })
        .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// POST /api/v1/roles/:role_id/assign — grant a server-scope role to a user.
async fn assign_server_role(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<Uuid>,
    Json(body): Json<AssignRoleRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let admin_id = auth.require_user()?;
    state
        .storage
        .db
        .write("assign_server_role", move |conn| {
            require_role_manage(conn, admin_id)?;
            roles::assign_server_role(conn, body.user_id, role_id)
        })
        .await?;
    Ok(Json(serde_json::json!({ "assigned": true })))
}

/// POST /api/v1/channels/:channel_id/roles/:role_id/assign — channel owner
/// grants a channel-scope role; replaces any prior role for that member.
async fn assign_channel_role(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path((channel_id, role_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<AssignRoleRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let caller = auth.require_user()?;
    state
        .storage
        .db
        .write("assign_channel_role", move |conn| {
            let channel = meridian_storage::repository::channels::find_by_id(conn, channel_id)?
                .ok_or_else(|| RelayError::not_found("channel"))?;
            if channel.owner != caller {
                return Err(RelayError::permission_denied("channel.role_manage"));
            }
            roles::assign_channel_role(conn, body.user_id, channel_id, role_id)
        })
        .await?;
    Ok(Json(serde_json::json!({ "assigned": true })))
}
