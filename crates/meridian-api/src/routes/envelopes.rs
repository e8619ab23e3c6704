//! Envelope Store & Delivery routes (C6) — 1:1 and group ciphertext queues.
//!
//! The server never inspects payloads. 1:1 sends are filtered the same way
//! as signaling events: if the recipient has blocked the sender, the send is
//! silently accepted and discarded rather than erroring, so a blocked sender
//! can't learn they've been blocked by probing delivery.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use meridian_common::{
    error::{RelayError, RelayResult},
    models::envelope::{ItemResponse, SendGroupItemRequest, SendItemRequest},
    validation::validate_request,
};
use meridian_storage::repository::{abuse, channels, envelopes};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/envelopes", post(send_item))
        .route("/envelopes/{recipient_device}", get(fetch_items))
        .route("/envelopes/{item_id}/ack", post(ack_item))
        .route("/envelopes/group", post(send_group_item))
        .route("/envelopes/group/{channel_id}", get(fetch_group_items))
        .route("/envelopes/group/{item_id}/read", post(mark_group_read))
}

/// POST /api/v1/envelopes — 1:1 send, idempotent on `item_id`.
async fn send_item(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendItemRequest>,
) -> RelayResult<Json<Option<ItemResponse>>> {
    let (sender, sender_device) = auth.require_client()?;
    validate_request(&body)?;

    let item = state
        .storage
        .db
        .write("send_item", move |conn| {
            if abuse::is_blocked(conn, body.recipient, sender)? {
                return Ok(None);
            }
            let item = envelopes::send_item(
                conn,
                body.item_id,
                body.recipient,
                body.recipient_device,
                sender,
                sender_device,
                &body.ciphertext,
                &body.message_type,
            )?;
            Ok(Some(item))
        })
        .await?;

    Ok(Json(item.map(Into::into)))
}

/// GET /api/v1/envelopes/:recipient_device — pending 1:1 items for one of the caller's devices.
async fn fetch_items(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(recipient_device): Path<Uuid>,
) -> RelayResult<Json<Vec<ItemResponse>>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    let items = envelopes::fetch_items(&conn, user_id, recipient_device)?;
    Ok(Json(items.into_iter().map(Into::into).collect()))
}

/// POST /api/v1/envelopes/:item_id/ack — delete once delivered/read.
async fn ack_item(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    auth.require_user()?;
    state.storage.db.write("ack_item", move |conn| envelopes::ack_item(conn, item_id)).await?;
    Ok(Json(serde_json::json!({ "acked": true })))
}

/// POST /api/v1/envelopes/group — group send: one `GroupItem` row no matter
/// how many members the channel currently has, since the payload is
/// encrypted once under the channel's sender-key.
async fn send_group_item(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendGroupItemRequest>,
) -> RelayResult<Json<ItemResponse>> {
    let (sender, sender_device) = auth.require_client()?;
    validate_request(&body)?;

    let item = state
        .storage
        .db
        .write("send_group_item", move |conn| {
            if !channels::is_member(conn, body.channel_id, sender)? {
                return Err(RelayError::permission_denied("channel.send"));
            }
            envelopes::send_group_item(conn, body.item_id, body.channel_id, sender, sender_device, &body.ciphertext, &body.message_type)
        })
        .await?;

    Ok(Json(item.into()))
}

#[derive(Debug, Deserialize)]
struct FetchGroupItemsQuery {
    since: Option<chrono::DateTime<Utc>>,
}

/// GET /api/v1/envelopes/group/:channel_id — items sent to the channel since
/// `?since=` (default: the epoch), for a member to pull while offline.
async fn fetch_group_items(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<FetchGroupItemsQuery>,
) -> RelayResult<Json<Vec<ItemResponse>>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    if !channels::is_member(&conn, channel_id, user_id)? {
        return Err(RelayError::permission_denied("channel.read"));
    }
    let since = query.since.unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap());
    let items = envelopes::fetch_group_items(&conn, channel_id, user_id, since)?;
    Ok(Json(items.into_iter().map(Into::into).collect()))
}

/// POST /api/v1/envelopes/group/:item_id/read — mark a group send read by
/// the caller's own device; a re-read from the same device is a no-op.
async fn mark_group_read(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let (user_id, device_id) = auth.require_client()?;
    state
        .storage
        .db
        .write("mark_group_item_read", move |conn| envelopes::mark_group_item_read(conn, item_id, user_id, device_id))
        .await?;
    let conn = state.storage.db.read()?;
    let count = envelopes::group_item_read_count(&conn, item_id)?;
    Ok(Json(serde_json::json!({ "readCount": count })))
}
