//! # meridian-gateway
//!
//! The Signaling Hub (C7): one persistent, bidirectional event stream per
//! authenticated client, WebRTC offer/answer/candidate relay, room rosters
//! for `stream`/`fileshare`/`meeting` rooms, and meeting chat/state events.
//!
//! Authentication reuses the REST layer's dual-auth resolution
//! (`meridian_api::middleware::resolve_auth`) against the WS upgrade
//! request's headers/cookies — a WS upgrade is an ordinary signed/cookied
//! HTTP request until the 101 response flips the connection.
//!
//! Blocking (C9) is enforced here as well as in the envelope path: before
//! any unicast or room broadcast that identifies a source user, recipients
//! who block that user are filtered out.

pub mod events;
pub mod rooms;
pub mod session;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use events::{MeetingMessageType, RoomKind, SignalingMessage};
use futures_util::{SinkExt, StreamExt};
use meridian_common::error::RelayError;
use meridian_common::relay_event::RelayEvent;
use meridian_storage::{repository::abuse, Storage};
use rooms::RoomRegistry;
use session::ClientRegistry;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Signaling Hub state, shared across all connections.
#[derive(Clone)]
pub struct GatewayState {
    pub storage: Storage,
    pub clients: Arc<ClientRegistry>,
    pub rooms: Arc<RoomRegistry>,
    /// Events the REST layer (C6/C8) pushes in — knocks, queued envelopes,
    /// membership changes — for this hub to forward to connected clients.
    pub relay_tx: broadcast::Sender<RelayEvent>,
}

impl GatewayState {
    /// Build a hub state sharing `relay_tx` with the REST `AppState` so both
    /// crates see the same event bus without a circular dependency.
    pub fn new(storage: Storage, relay_tx: broadcast::Sender<RelayEvent>) -> Self {
        Self { storage, clients: ClientRegistry::new(), rooms: Arc::new(RoomRegistry::new()), relay_tx }
    }
}

/// Build the Signaling Hub's WebSocket router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new().route("/signaling", get(ws_handler)).with_state(Arc::new(state))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>, headers: axum::http::HeaderMap) -> Response {
    let auth = match meridian_api::middleware::resolve_auth(&state.storage, &headers, "/signaling", "GET", b"").await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let Some(user_id) = auth.user_id() else {
        return RelayError::AuthMissing.into_response();
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
}

/// One connected signaling client's lifetime: register, forward its mailbox
/// to the socket, process incoming frames until close, then clean up.
async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut mailbox) = state.clients.register(user_id).await;

    tracing::info!(client = %client_id, user = %user_id, "signaling client connected");

    let mut relay_rx = state.relay_tx.subscribe();
    let writer_state = state.clone();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = mailbox.recv() => {
                    match msg {
                        Some(msg) => {
                            if sender.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = relay_rx.recv() => {
                    let Ok(event) = event else { continue };
                    if event.event_type != "knock" {
                        continue;
                    }
                    let Some(room_id) = event.channel_id else { continue };
                    // Only forward the knock to clients currently present in
                    // that meeting room — they're the ones who can admit.
                    if !writer_state.rooms.members(room_id).await.contains(&client_id) {
                        continue;
                    }
                    let msg = SignalingMessage::Knock {
                        room_id: room_id.to_string(),
                        session_id: event.data.get("sessionId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        display_name: event.data.get("displayName").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    };
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(signal) => handle_signal(&state, client_id, user_id, signal).await,
                    Err(e) => {
                        if let Some(handle) = state.clients.get(client_id).await {
                            handle.send(&SignalingMessage::Error { code: 4000, message: format!("invalid message: {e}") }).await;
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    cleanup_connection(&state, client_id, user_id).await;
    tracing::info!(client = %client_id, user = %user_id, "signaling client disconnected");
}

async fn handle_signal(state: &Arc<GatewayState>, client_id: Uuid, user_id: Uuid, signal: SignalingMessage) {
    match signal {
        SignalingMessage::Offer { target_id, sdp, .. } => {
            relay_to_target(state, client_id, user_id, &target_id, |source_id| SignalingMessage::Offer {
                target_id: target_id.clone(),
                sdp,
                source_id: Some(source_id),
            })
            .await;
        }
        SignalingMessage::Answer { target_id, sdp, .. } => {
            relay_to_target(state, client_id, user_id, &target_id, |source_id| SignalingMessage::Answer {
                target_id: target_id.clone(),
                sdp,
                source_id: Some(source_id),
            })
            .await;
        }
        SignalingMessage::Candidate { target_id, candidate, .. } => {
            relay_to_target(state, client_id, user_id, &target_id, |source_id| SignalingMessage::Candidate {
                target_id: target_id.clone(),
                candidate,
                source_id: Some(source_id),
            })
            .await;
        }
        SignalingMessage::Watch { room_id } => {
            join_room(state, client_id, user_id, &room_id, RoomKind::Stream).await;
        }
        SignalingMessage::Client { room_id, file_name } => {
            join_room(state, client_id, user_id, &room_id, RoomKind::Fileshare).await;
            let Ok(room_id) = room_id.parse::<Uuid>() else { return };
            broadcast_to_room(state, room_id, user_id, SignalingMessage::Client { room_id: room_id.to_string(), file_name }).await;
        }
        SignalingMessage::Stream { room_id, host_id } => {
            join_room(state, client_id, user_id, &room_id, RoomKind::Stream).await;
            let Ok(room_id) = room_id.parse::<Uuid>() else { return };
            broadcast_to_room(state, room_id, user_id, SignalingMessage::Stream { room_id: room_id.to_string(), host_id }).await;
        }
        SignalingMessage::SetSlots { room_id, n } => {
            let Ok(room_id) = room_id.parse::<Uuid>() else { return };
            state.rooms.set_slots(room_id, n).await;
            broadcast_to_room(state, room_id, user_id, SignalingMessage::SetSlots { room_id: room_id.to_string(), n }).await;
        }
        SignalingMessage::OfferFile { room_id, name, size } => {
            let Ok(parsed) = room_id.parse::<Uuid>() else { return };
            broadcast_to_room(state, parsed, user_id, SignalingMessage::OfferFile { room_id, name, size }).await;
        }
        SignalingMessage::DownloadFile { room_id, file_name, host_id } => {
            relay_to_target(state, client_id, user_id, &host_id, |source_id| SignalingMessage::DownloadFile {
                room_id: room_id.clone(),
                file_name: file_name.clone(),
                host_id: source_id,
            })
            .await;
        }
        SignalingMessage::DeleteFile { file_name } => {
            // No room context on this event; broadcast to every
            // room the sender currently occupies, without evicting it.
            for room_id in state.rooms.rooms_for_client(client_id).await {
                broadcast_to_room(state, room_id, user_id, SignalingMessage::DeleteFile { file_name: file_name.clone() }).await;
            }
        }
        SignalingMessage::GetFiles { room_id } => {
            if let Some(handle) = state.clients.get(client_id).await {
                handle.send(&SignalingMessage::FileList { room_id, files: Vec::new() }).await;
            }
        }
        SignalingMessage::DisconnectPeer { id } => {
            relay_to_target(state, client_id, user_id, &id, |_source_id| SignalingMessage::DisconnectPeer { id: id.clone() }).await;
            tracing::debug!(requested_by = %client_id, target = %id, "disconnectPeer requested");
        }
        SignalingMessage::JoinMeeting { room_id, name } => {
            join_meeting(state, client_id, user_id, &room_id, &name).await;
        }
        SignalingMessage::LeaveMeeting => {
            for (room_id, _) in state.rooms.leave_all(client_id).await {
                if matches!(state.rooms.meta(room_id).await.map(|m| m.kind), Some(RoomKind::Meeting)) {
                    broadcast_meeting_message(state, room_id, user_id, MeetingMessageType::Leave, serde_json::json!({})).await;
                }
            }
        }
        SignalingMessage::GetParticipants { room_id } => {
            let Ok(parsed) = room_id.parse::<Uuid>() else { return };
            let members = state.rooms.members(parsed).await;
            if let Some(handle) = state.clients.get(client_id).await {
                let participants = members.iter().map(|id| serde_json::json!({ "clientId": id })).collect();
                handle.send(&SignalingMessage::Participants { room_id, participants }).await;
            }
        }
        SignalingMessage::Message { room_id, r#type, payload } => {
            let Ok(parsed) = room_id.parse::<Uuid>() else { return };
            broadcast_meeting_message(state, parsed, user_id, r#type, payload).await;
        }
        // Hub -> client-only variants are never received from a client.
        SignalingMessage::CurrentPeers { .. }
        | SignalingMessage::FileList { .. }
        | SignalingMessage::Participants { .. }
        | SignalingMessage::Roster { .. }
        | SignalingMessage::Knock { .. }
        | SignalingMessage::Error { .. } => {
            if let Some(handle) = state.clients.get(client_id).await {
                handle.send(&SignalingMessage::Error { code: 4001, message: "server-only event".into() }).await;
            }
        }
    }
}

/// Admission: `stream`/`fileshare` are free-join subject to
/// slots; the caller determines kind from the event that triggered the join.
async fn join_room(state: &Arc<GatewayState>, client_id: Uuid, _user_id: Uuid, room_id: &str, kind: RoomKind) {
    let Ok(room_id) = room_id.parse::<Uuid>() else { return };
    let host = state.rooms.meta(room_id).await.map(|m| m.host).unwrap_or(client_id);
    match state.rooms.join(room_id, kind, host, client_id).await {
        Ok(_) => {
            broadcast_roster(state, room_id, client_id, true).await;
            send_current_peers(state, room_id).await;
        }
        Err(e) => {
            if let Some(handle) = state.clients.get(client_id).await {
                handle.send(&SignalingMessage::Error { code: 4002, message: e.to_string() }).await;
            }
        }
    }
}

/// Meeting admission: authenticated users on the invited list
/// or holding the appropriate channel role may join immediately. External
/// guests come through a separate path (the REST-layer `ExternalSession`
/// admission flow) and are not handled by this event.
async fn join_meeting(state: &Arc<GatewayState>, client_id: Uuid, user_id: Uuid, room_id: &str, name: &str) {
    let Ok(parsed) = room_id.parse::<Uuid>() else { return };

    let meeting = {
        let conn = match state.storage.db.read() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        meridian_storage::repository::meetings::find_by_room_id(&conn, parsed).ok().flatten()
    };
    let Some(meeting) = meeting else {
        if let Some(handle) = state.clients.get(client_id).await {
            handle.send(&SignalingMessage::Error { code: 4040, message: "meeting not found".into() }).await;
        }
        return;
    };

    let allowed = meeting.organizer == user_id || {
        let conn = state.storage.db.read().ok();
        conn.map(|conn| meridian_storage::repository::meetings::is_invited(&conn, meeting.id, user_id).unwrap_or(false))
            .unwrap_or(false)
    };
    if !allowed {
        if let Some(handle) = state.clients.get(client_id).await {
            handle.send(&SignalingMessage::Error { code: 4030, message: "not invited to this meeting".into() }).await;
        }
        return;
    }

    if state.rooms.join(parsed, RoomKind::Meeting, meeting.organizer, client_id).await.is_err() {
        return;
    }

    let participants = state
        .rooms
        .members(parsed)
        .await
        .iter()
        .map(|id| serde_json::json!({ "clientId": id }))
        .collect();
    if let Some(handle) = state.clients.get(client_id).await {
        handle.send(&SignalingMessage::Participants { room_id: room_id.to_string(), participants }).await;
    }
    broadcast_meeting_message(state, parsed, user_id, MeetingMessageType::Join, serde_json::json!({ "name": name })).await;
}

/// Unicast to `target_id` (a `clientId`), applying the blocking filter: if
/// `target_id`'s owning user has blocked `source_user`, the message is
/// silently dropped rather than erroring.
async fn relay_to_target<F>(state: &Arc<GatewayState>, _source_client: Uuid, source_user: Uuid, target_id: &str, build: F)
where
    F: FnOnce(String) -> SignalingMessage,
{
    let Ok(target_client_id) = target_id.parse::<Uuid>() else { return };
    let Some(handle) = state.clients.get(target_client_id).await else { return };

    if is_blocked_by(state, handle.user_id, source_user) {
        return;
    }

    handle.send(&build(source_user.to_string())).await;
}

/// Broadcast to every client in `room_id` except the originator, filtering
/// out members whose owning user has blocked `source_user`.
async fn broadcast_to_room(state: &Arc<GatewayState>, room_id: Uuid, source_user: Uuid, msg: SignalingMessage) {
    for member in state.rooms.members(room_id).await {
        let Some(handle) = state.clients.get(member).await else { continue };
        if handle.user_id == source_user {
            continue;
        }
        if is_blocked_by(state, handle.user_id, source_user) {
            continue;
        }
        handle.send(&msg).await;
    }
}

async fn broadcast_meeting_message(state: &Arc<GatewayState>, room_id: Uuid, source_user: Uuid, r#type: MeetingMessageType, payload: serde_json::Value) {
    broadcast_to_room(state, room_id, source_user, SignalingMessage::Message { room_id: room_id.to_string(), r#type, payload }).await;
}

async fn broadcast_roster(state: &Arc<GatewayState>, room_id: Uuid, client_id: Uuid, joined: bool) {
    let Some(handle) = state.clients.get(client_id).await else { return };
    broadcast_to_room(state, room_id, handle.user_id, SignalingMessage::Roster { room_id: room_id.to_string(), client_id: client_id.to_string(), joined }).await;
}

async fn send_current_peers(state: &Arc<GatewayState>, room_id: Uuid) {
    let n = state.rooms.member_count(room_id).await;
    for member in state.rooms.members(room_id).await {
        if let Some(handle) = state.clients.get(member).await {
            handle.send(&SignalingMessage::CurrentPeers { n }).await;
        }
    }
}

fn is_blocked_by(state: &Arc<GatewayState>, blocker: Uuid, blocked: Uuid) -> bool {
    let Ok(conn) = state.storage.db.read() else { return false };
    abuse::is_blocked(&conn, blocker, blocked).unwrap_or(false)
}

/// Disconnection cleanup: remove from every room, broadcast a
/// synthetic `leave` (the `message` event for meeting rooms, a bare roster
/// event for stream/fileshare), then decrement peer counters.
async fn cleanup_connection(state: &Arc<GatewayState>, client_id: Uuid, user_id: Uuid) {
    state.clients.unregister(client_id, user_id).await;

    for (room_id, _) in state.rooms.leave_all(client_id).await {
        let kind = state.rooms.meta(room_id).await.map(|m| m.kind);
        if matches!(kind, Some(RoomKind::Meeting)) {
            broadcast_meeting_message(state, room_id, user_id, MeetingMessageType::Leave, serde_json::json!({})).await;
        } else {
            broadcast_to_room(state, room_id, user_id, SignalingMessage::Roster { room_id: room_id.to_string(), client_id: client_id.to_string(), joined: false }).await;
        }
        send_current_peers(state, room_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn room_registry_enforces_slots() {
        let rooms = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let host = Uuid::new_v4();
        rooms.set_slots(room_id, 1).await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(rooms.join(room_id, RoomKind::Stream, host, a).await.is_ok());
        assert!(rooms.join(room_id, RoomKind::Stream, host, b).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_client_from_every_room() {
        let rooms = RoomRegistry::new();
        let host = Uuid::new_v4();
        let client = Uuid::new_v4();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        rooms.join(room_a, RoomKind::Stream, host, client).await.unwrap();
        rooms.join(room_b, RoomKind::Fileshare, host, client).await.unwrap();

        let left = rooms.leave_all(client).await;
        assert_eq!(left.len(), 2);
        assert_eq!(rooms.member_count(room_a).await, 0);
        assert_eq!(rooms.member_count(room_b).await, 0);
    }

    #[tokio::test]
    async fn client_registry_tracks_multiple_devices_per_user() {
        let registry = ClientRegistry::new();
        let user_id = Uuid::new_v4();
        let (c1, _rx1) = registry.register(user_id).await;
        let (c2, _rx2) = registry.register(user_id).await;
        assert_ne!(c1, c2);
        assert_eq!(registry.clients_for_user(user_id).await.len(), 2);
        registry.unregister(c1, user_id).await;
        assert_eq!(registry.clients_for_user(user_id).await.len(), 1);
    }
}
