//! Meeting Coordinator routes (C8) — scheduling, RSVPs, invitation tokens,
//! and external guest admission ("knock to join"). The realtime knock/admit
//! push and the actual WebRTC signaling happen in the Signaling Hub; this
//! layer owns the durable meeting/RSVP/token state and the volatile
//! `ExternalSession` admission state.

use axum::{
    extract::{Extension, Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use meridian_common::{
    error::{RelayError, RelayResult},
    models::meeting::{
        CreateInvitationTokenRequest, CreateMeetingRequest, GuestJoinRequest, GuestJoinResponse, Meeting,
        MeetingSettingsResponse, RsvpCounts, SetRsvpRequest,
    },
    relay_event::RelayEvent,
    validation::validate_request,
};
use meridian_storage::repository::meetings;
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/meetings", post(create_meeting))
        .route("/meetings/{meeting_id}", get(get_meeting_settings))
        .route("/meetings/{meeting_id}/rsvp", post(set_rsvp))
        .route("/meetings/{meeting_id}/rsvp/counts", get(rsvp_counts))
        .route("/meetings/{meeting_id}/invitations", post(create_invitation_token))
        .route("/meetings/guest/join", post(guest_join))
        .route("/meetings/guest/{session_id}/admission", post(request_admission))
        .route("/meetings/guest/{session_id}/admit", post(admit_guest))
        .route("/meetings/guest/{session_id}/decline", post(decline_guest))
}

/// POST /api/v1/meetings — create a meeting; persistent if `scheduledMeeting`, ephemeral otherwise.
async fn create_meeting(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateMeetingRequest>,
) -> RelayResult<Json<Meeting>> {
    let organizer = auth.require_user()?;
    validate_request(&body)?;

    let meeting = state
        .storage
        .db
        .write("create_meeting", move |conn| {
            meetings::create_meeting(
                conn,
                organizer,
                &body.meeting_name,
                body.meeting_description.as_deref(),
                body.instant_meeting,
                body.scheduled_meeting,
                body.meeting_date,
                body.voice_only.unwrap_or(false),
                body.enable_chat.unwrap_or(true),
                body.enable_recording.unwrap_or(false),
                body.muted.unwrap_or(false),
                body.camera_off.unwrap_or(false),
                body.max_cam_resolution.as_deref(),
            )
        })
        .await?;

    Ok(Json(meeting))
}

/// GET /api/v1/meetings/:meeting_id — settings retrieval; also enforces the
/// 30-minute-before-start join window for scheduled meetings.
async fn get_meeting_settings(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(meeting_id): Path<Uuid>,
) -> RelayResult<Json<MeetingSettingsResponse>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    let meeting = meetings::find_by_id(&conn, meeting_id)?.ok_or_else(|| RelayError::not_found("meeting"))?;

    if meeting.scheduled_meeting {
        if let Some(date) = meeting.meeting_date {
            let config = meridian_common::config::get();
            let window_opens = date - chrono::Duration::seconds(config.meetings.lookahead_secs);
            if Utc::now() < window_opens && meeting.organizer != user_id {
                return Err(RelayError::validation("meeting has not opened for joining yet"));
            }
        }
    }

    Ok(Json(MeetingSettingsResponse { settings: meeting }))
}

/// POST /api/v1/meetings/:meeting_id/rsvp — `invited -> {accepted, declined, tentative}`.
async fn set_rsvp(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(meeting_id): Path<Uuid>,
    Json(body): Json<SetRsvpRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    state
        .storage
        .db
        .write("set_rsvp", move |conn| meetings::set_rsvp(conn, meeting_id, user_id, body.status))
        .await?;
    Ok(Json(serde_json::json!({ "status": body.status })))
}

/// GET /api/v1/meetings/:meeting_id/rsvp/counts — organizer's aggregated view.
async fn rsvp_counts(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(meeting_id): Path<Uuid>,
) -> RelayResult<Json<RsvpCounts>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    let meeting = meetings::find_by_id(&conn, meeting_id)?.ok_or_else(|| RelayError::not_found("meeting"))?;
    if meeting.organizer != user_id {
        return Err(RelayError::permission_denied("meeting.view_rsvps"));
    }
    Ok(Json(meetings::rsvp_counts(&conn, meeting_id)?))
}

/// POST /api/v1/meetings/:meeting_id/invitations — a reusable, labeled guest link.
async fn create_invitation_token(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(meeting_id): Path<Uuid>,
    Json(body): Json<CreateInvitationTokenRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    validate_request(&body)?;

    let token = state
        .storage
        .db
        .write("create_invitation_token", move |conn| {
            let meeting = meetings::find_by_id(conn, meeting_id)?.ok_or_else(|| RelayError::not_found("meeting"))?;
            if meeting.organizer != user_id {
                return Err(RelayError::permission_denied("meeting.invite"));
            }
            meetings::create_invitation_token(conn, Some(meeting_id), body.label.as_deref(), body.expires_at, body.max_uses)
        })
        .await?;

    Ok(Json(serde_json::json!(token)))
}

/// POST /api/v1/meetings/guest/join — an external guest exchanges an invitation
/// token for a session id; `admitted` starts `None` until they knock.
async fn guest_join(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GuestJoinRequest>,
) -> RelayResult<Json<GuestJoinResponse>> {
    validate_request(&body)?;
    let GuestJoinRequest { invitation_token, display_name, prekey_bundle } = body;

    let token = state
        .storage
        .db
        .write("consume_invitation_token", move |conn| meetings::consume_invitation_token(conn, &invitation_token))
        .await?;
    let meeting_id = token.meeting_id.ok_or_else(|| RelayError::validation("invitation token is not bound to a meeting"))?;
    let conn = state.storage.db.read()?;
    let meeting = meetings::find_by_id(&conn, meeting_id)?.ok_or_else(|| RelayError::not_found("meeting"))?;

    let session_id = meridian_common::id::generate_id();
    state.storage.memory.put_external_session(meridian_common::models::ExternalSession {
        session_id,
        room_id: meeting.room_id,
        display_name,
        prekey_bundle,
        admitted: None,
        last_admission_request: None,
        joined_at: None,
        created_at: Utc::now(),
    });

    Ok(Json(GuestJoinResponse { session_id }))
}

/// POST /api/v1/meetings/guest/:session_id/admission — "knock"; enforces a
/// per-session cooldown between consecutive requests.
async fn request_admission(State(state): State<Arc<AppState>>, Path(session_id): Path<Uuid>) -> RelayResult<Json<serde_json::Value>> {
    let config = meridian_common::config::get();
    let now = Utc::now();

    let session = state.storage.memory.get_external_session(session_id).ok_or_else(|| RelayError::not_found("guest session"))?;
    if let Some(last) = session.last_admission_request {
        if now - last < chrono::Duration::seconds(config.meetings.admission_cooldown_secs) {
            return Err(RelayError::rate_limited((config.meetings.admission_cooldown_secs - (now - last).num_seconds()).max(0) as u64));
        }
    }

    state.storage.memory.update_external_session(session_id, |s| {
        s.admitted = Some(false);
        s.last_admission_request = Some(now);
    });

    // Notify admitting-capable members through the Signaling Hub. Nobody
    // subscribed (hub not running, or no admins connected) is not an error —
    // the guest can still be admitted later via a poll of pending knocks.
    let _ = state.relay_tx.send(
        RelayEvent::new(
            "knock",
            serde_json::json!({
                "sessionId": session_id,
                "displayName": session.display_name,
            }),
        )
        .with_channel(session.room_id),
    );

    Ok(Json(serde_json::json!({ "requested": true })))
}

/// Only the meeting's organizer may admit or decline a knocking guest.
/// Fetching the session first (rather than trusting the caller) means an
/// unknown `session_id` reports 404 before any permission check runs.
fn require_organizer(state: &AppState, session_id: Uuid, user_id: Uuid) -> RelayResult<meridian_common::models::ExternalSession> {
    let session = state.storage.memory.get_external_session(session_id).ok_or_else(|| RelayError::not_found("guest session"))?;
    let conn = state.storage.db.read()?;
    let meeting = meetings::find_by_room_id(&conn, session.room_id)?.ok_or_else(|| RelayError::not_found("meeting"))?;
    if meeting.organizer != user_id {
        return Err(RelayError::permission_denied("meeting.admit"));
    }
    Ok(session)
}

/// POST /api/v1/meetings/guest/:session_id/admit — host admits a knocking guest.
async fn admit_guest(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    require_organizer(&state, session_id, user_id)?;
    let now = Utc::now();
    let session = state
        .storage
        .memory
        .update_external_session(session_id, |s| {
            s.admitted = Some(true);
            s.joined_at = Some(now);
        })
        .ok_or_else(|| RelayError::not_found("guest session"))?;
    Ok(Json(serde_json::json!({ "admitted": true, "sessionId": session.session_id })))
}

/// POST /api/v1/meetings/guest/:session_id/decline — resets to `admitted=null`
/// so the guest may re-knock after the cooldown.
async fn decline_guest(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    require_organizer(&state, session_id, user_id)?;
    state
        .storage
        .memory
        .update_external_session(session_id, |s| {
            s.admitted = None;
        })
        .ok_or_else(|| RelayError::not_found("guest session"))?;
    Ok(Json(serde_json::json!({ "declined": true })))
}
