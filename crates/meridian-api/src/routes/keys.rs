//! Signal Key Directory routes (C5) — pre-key upload/rotation, bundle fetch,
//! and per-channel sender-key distribution for group fan-out.

use axum::{
    extract::{Extension, Path, State},
    routing::{get, post},
    Json, Router,
};
use meridian_common::{
    error::{RelayError, RelayResult},
    models::{
        channel::ChannelType,
        crypto::{KeyBundle, PreKeyCountResponse, RotateSignedPreKeyRequest, UploadPreKeysRequest, UploadSenderKeyRequest},
    },
};
use meridian_storage::repository::{channels, clients, keystore};
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/keys/prekeys", post(upload_prekeys))
        .route("/keys/prekeys/count", get(prekey_count))
        .route("/keys/signed-prekey", post(rotate_signed_prekey))
        .route("/keys/bundle/{client_id}", get(get_key_bundle))
        .route("/channels/{channel_id}/sender-key", post(upload_sender_key))
        .route("/channels/{channel_id}/sender-keys", get(list_sender_keys))
}

/// POST /api/v1/keys/prekeys — upload a batch of one-time pre-keys for the caller's device.
async fn upload_prekeys(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UploadPreKeysRequest>,
) -> RelayResult<Json<PreKeyCountResponse>> {
    let (owner, client_id) = auth.require_client()?;
    let keys: Vec<(i32, String)> = body.keys.into_iter().map(|k| (k.prekey_id, k.prekey_data)).collect();

    let remaining = state
        .storage
        .db
        .write("upload_prekeys", move |conn| {
            keystore::upload_prekeys(conn, client_id, owner, &keys)?;
            keystore::remaining_prekey_count(conn, client_id)
        })
        .await?;

    Ok(Json(PreKeyCountResponse { client_id, remaining }))
}

/// GET /api/v1/keys/prekeys/count — how many one-time pre-keys remain unconsumed.
async fn prekey_count(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<PreKeyCountResponse>> {
    let (_, client_id) = auth.require_client()?;
    let conn = state.storage.db.read()?;
    let remaining = keystore::remaining_prekey_count(&conn, client_id)?;
    Ok(Json(PreKeyCountResponse { client_id, remaining }))
}

/// POST /api/v1/keys/signed-prekey — overwrite the caller's current signed pre-key.
async fn rotate_signed_prekey(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<RotateSignedPreKeyRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let (owner, client_id) = auth.require_client()?;

    state
        .storage
        .db
        .write("rotate_signed_prekey", move |conn| {
            keystore::rotate_signed_prekey(conn, client_id, owner, body.signed_prekey_id, &body.signed_prekey_data, &body.signed_prekey_signature)
        })
        .await?;

    Ok(Json(serde_json::json!({ "rotated": true })))
}

/// GET /api/v1/keys/bundle/:client_id — X3DH initiator fetch; consumes exactly
/// one one-time pre-key, serialized through the storage writer.
async fn get_key_bundle(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<Uuid>,
) -> RelayResult<Json<KeyBundle>> {
    auth.require_user()?;

    let bundle = state
        .storage
        .db
        .write("fetch_key_bundle", move |conn| {
            let identity_key = clients::find_by_client_id(conn, client_id)?.and_then(|c| c.public_key);
            keystore::get_key_bundle(conn, client_id, identity_key)
        })
        .await?
        .ok_or_else(|| RelayError::not_found("key bundle"))?;

    Ok(Json(bundle))
}

/// POST /api/v1/channels/:channel_id/sender-key — upload/replace the caller's
/// sender key for a group Signal channel; requires membership.
async fn upload_sender_key(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Json(body): Json<UploadSenderKeyRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let (owner, client_id) = auth.require_client()?;

    state
        .storage
        .db
        .write("upload_sender_key", move |conn| {
            let channel = channels::find_by_id(conn, channel_id)?.ok_or_else(|| RelayError::not_found("channel"))?;
            if channel.channel_type != ChannelType::Signal {
                return Err(RelayError::validation("sender keys only apply to signal channels"));
            }
            if !channels::is_member(conn, channel_id, owner)? {
                return Err(RelayError::permission_denied("senderkey.upload"));
            }
            keystore::upload_sender_key(conn, channel_id, client_id, owner, &body.sender_key)
        })
        .await?;

    Ok(Json(serde_json::json!({ "uploaded": true })))
}

/// GET /api/v1/channels/:channel_id/sender-keys — every member device's current
/// sender key, for a joining member to seed its group session from.
async fn list_sender_keys(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    if !channels::is_member(&conn, channel_id, user_id)? {
        return Err(RelayError::permission_denied("senderkey.fetch"));
    }
    let keys = keystore::sender_keys_for_channel(&conn, channel_id)?;
    let payload: Vec<_> = keys
        .into_iter()
        .map(|(client_id, owner, sender_key)| serde_json::json!({ "clientId": client_id, "owner": owner, "senderKey": sender_key }))
        .collect();
    Ok(Json(serde_json::json!(payload)))
}
