//! Server Admin routes (C10) — single-row server settings and 6-character
//! signup invitations. Settings are readable by anyone (a client needs
//! `registrationMode` before it can even show a register form); everything
//! that changes state requires `server.manage`.

use axum::{
    extract::{Extension, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Duration;
use meridian_common::{
    error::{RelayError, RelayResult},
    models::admin::{
        CreateInvitationRequest, Invitation, InvitationResponse, ServerSettings, UpdateServerSettingsRequest,
        VerifyInvitationRequest,
    },
    permissions::PermissionSet,
};
use meridian_storage::repository::{admin, roles};
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

/// Default lifetime of a signup invitation.
const INVITATION_TTL_DAYS: i64 = 7;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/settings", get(get_settings).patch(update_settings))
        .route("/admin/invitations", get(list_invitations).post(create_invitation))
        .route("/admin/invitations/verify", post(verify_invitation))
}

fn require_server_manage(conn: &rusqlite::Connection, user_id: Uuid) -> RelayResult<()> {
    let perms = roles::server_permissions_for_user(conn, user_id)?;
    if !PermissionSet::from_iter(perms).has("server.manage") {
        return Err(RelayError::permission_denied("server.manage"));
    }
    Ok(())
}

/// GET /api/v1/admin/settings — public; seeds defaults on first access.
async fn get_settings(State(state): State<Arc<AppState>>) -> RelayResult<Json<ServerSettings>> {
    let conn = state.storage.db.read()?;
    Ok(Json(admin::get_settings(&conn)?))
}

/// PATCH /api/v1/admin/settings
async fn update_settings(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateServerSettingsRequest>,
) -> RelayResult<Json<ServerSettings>> {
    let user_id = auth.require_user()?;

    let settings = state
        .storage
        .db
        .write("update_settings", move |conn| {
            require_server_manage(conn, user_id)?;
            admin::update_settings(
                conn,
                body.server_name.as_deref(),
                body.server_picture.as_deref(),
                body.registration_mode,
                body.allowed_email_suffixes.as_deref(),
            )
        })
        .await?;

    Ok(Json(settings))
}

/// GET /api/v1/admin/invitations
async fn list_invitations(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<Vec<Invitation>>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    require_server_manage(&conn, user_id)?;
    Ok(Json(admin::list_invitations(&conn)?))
}

/// POST /api/v1/admin/invitations — mint a 6-character signup token for an email.
async fn create_invitation(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateInvitationRequest>,
) -> RelayResult<Json<InvitationResponse>> {
    let created_by = auth.require_user()?;

    let invitation = state
        .storage
        .db
        .write("create_invitation", move |conn| {
            require_server_manage(conn, created_by)?;
            admin::create_invitation(conn, &body.email, created_by, Duration::days(INVITATION_TTL_DAYS))
        })
        .await?;

    Ok(Json(InvitationResponse {
        email: invitation.email,
        token: invitation.token,
        expires_at: invitation.expires_at,
    }))
}

/// POST /api/v1/admin/invitations/verify — the `invitation_only` registration
/// gate; consumes the invitation on success so it can't be replayed.
async fn verify_invitation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyInvitationRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let valid = state
        .storage
        .db
        .write("verify_invitation", move |conn| {
            admin::verify_and_consume_invitation(conn, &body.email, &body.token, chrono::Utc::now())
        })
        .await?;

    if !valid {
        return Err(RelayError::validation("invitation is invalid, expired, or already used"));
    }
    Ok(Json(serde_json::json!({ "verified": true })))
}
