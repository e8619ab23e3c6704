//! Channel routes — E2EE messaging and WebRTC signaling rooms.
//!
//! A channel's owner always has every permission on it (`permissions::member_has_permission`
//! bypass); everyone else needs it granted through a channel-scoped role, enforced here by
//! checking membership and ownership directly since per-channel role assignment is managed
//! through `routes::roles`.

use axum::{
    extract::{Extension, Path, State},
    routing::get,
    Json, Router,
};
use meridian_common::{
    error::{RelayError, RelayResult},
    models::channel::{AddMemberRequest, Channel, ChannelMember, CreateChannelRequest},
    validation::validate_request,
};
use meridian_storage::repository::channels;
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/{channel_id}", get(get_channel).delete(delete_channel))
        .route("/channels/{channel_id}/members", get(list_members).post(add_member))
        .route("/channels/{channel_id}/members/{user_id}", axum::routing::delete(remove_member))
}

/// GET /api/v1/channels — channels the caller belongs to.
async fn list_channels(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<Vec<Channel>>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    Ok(Json(channels::list_for_member(&conn, user_id)?))
}

/// POST /api/v1/channels — the caller becomes the owner and first member.
async fn create_channel(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChannelRequest>,
) -> RelayResult<Json<Channel>> {
    let user_id = auth.require_user()?;
    validate_request(&body)?;

    let channel = state
        .storage
        .db
        .write("create_channel", move |conn| {
            channels::create_channel(conn, user_id, &body.name, body.description.as_deref(), body.channel_type, body.private.unwrap_or(false))
        })
        .await?;

    Ok(Json(channel))
}

async fn get_channel(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> RelayResult<Json<Channel>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    let channel = channels::find_by_id(&conn, channel_id)?.ok_or_else(|| RelayError::not_found("channel"))?;
    if channel.private && !channels::is_member(&conn, channel_id, user_id)? {
        return Err(RelayError::not_found("channel"));
    }
    Ok(Json(channel))
}

/// DELETE /api/v1/channels/:channel_id — owner only.
async fn delete_channel(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;

    state
        .storage
        .db
        .write("delete_channel", move |conn| {
            let channel = channels::find_by_id(conn, channel_id)?.ok_or_else(|| RelayError::not_found("channel"))?;
            if channel.owner != user_id {
                return Err(RelayError::permission_denied("channel.delete"));
            }
            channels::delete_channel(conn, channel_id)
        })
        .await?;

    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn list_members(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> RelayResult<Json<Vec<ChannelMember>>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    channels::find_by_id(&conn, channel_id)?.ok_or_else(|| RelayError::not_found("channel"))?;
    if !channels::is_member(&conn, channel_id, user_id)? {
        return Err(RelayError::permission_denied("channel.view"));
    }
    Ok(Json(channels::members(&conn, channel_id)?))
}

/// POST /api/v1/channels/:channel_id/members — owner adds a member.
async fn add_member(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Json(body): Json<AddMemberRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    let new_member = body.user_id;

    state
        .storage
        .db
        .write("add_channel_member", move |conn| {
            let channel = channels::find_by_id(conn, channel_id)?.ok_or_else(|| RelayError::not_found("channel"))?;
            if channel.owner != user_id {
                return Err(RelayError::permission_denied("channel.manage_members"));
            }
            channels::add_member(conn, channel_id, new_member)
        })
        .await?;

    Ok(Json(serde_json::json!({ "added": true })))
}

/// DELETE /api/v1/channels/:channel_id/members/:user_id — owner removes a member,
/// or a member removes themselves.
async fn remove_member(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path((channel_id, target_user)): Path<(Uuid, Uuid)>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;

    state
        .storage
        .db
        .write("remove_channel_member", move |conn| {
            let channel = channels::find_by_id(conn, channel_id)?.ok_or_else(|| RelayError::not_found("channel"))?;
            if channel.owner != user_id && user_id != target_user {
                return Err(RelayError::permission_denied("channel.manage_members"));
            }
            channels::remove_member(conn, channel_id, target_user)
        })
        .await?;

    Ok(Json(serde_json::json!({ "removed": true })))
}
