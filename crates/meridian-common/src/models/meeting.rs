//! Meeting Coordinator model — scheduled/ephemeral meetings, RSVPs,
//! invitation tokens, and guest admission ("knock to join").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub room_id: Uuid,
    pub organizer: Uuid,
    pub meeting_name: String,
    pub meeting_description: Option<String>,
    pub instant_meeting: bool,
    pub scheduled_meeting: bool,
    pub meeting_date: Option<DateTime<Utc>>,
    pub voice_only: bool,
    pub enable_chat: bool,
    pub enable_recording: bool,
    pub muted: bool,
    pub camera_off: bool,
    pub max_cam_resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsvpStatus {
    Invited,
    Accepted,
    Declined,
    Tentative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingInvitation {
    pub meeting_id: Uuid,
    pub invitee: Uuid,
    pub invited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRsvp {
    pub meeting_id: Uuid,
    pub user_id: Uuid,
    pub status: RsvpStatus,
    pub updated_at: DateTime<Utc>,
}

/// A reusable invitation token, independent of any specific invitee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationToken {
    pub token: String,
    pub meeting_id: Option<Uuid>,
    pub label: Option<String>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i64>,
    pub use_count: i64,
    pub created_at: DateTime<Utc>,
}

/// An admitted-or-pending external (non-member) guest in a meeting room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSession {
    pub session_id: Uuid,
    pub room_id: Uuid,
    pub display_name: String,
    pub prekey_bundle: String,
    /// `None` = never knocked, `Some(false)` = knocked/pending, `Some(true)` = admitted.
    pub admitted: Option<bool>,
    pub last_admission_request: Option<DateTime<Utc>>,
    pub joined_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMeetingRequest {
    #[validate(length(min = 1, max = 200))]
    pub meeting_name: String,
    pub meeting_description: Option<String>,
    pub instant_meeting: bool,
    pub scheduled_meeting: bool,
    pub meeting_date: Option<DateTime<Utc>>,
    pub voice_only: Option<bool>,
    pub enable_chat: Option<bool>,
    pub enable_recording: Option<bool>,
    pub muted: Option<bool>,
    pub camera_off: Option<bool>,
    pub max_cam_resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetRsvpRequest {
    pub status: RsvpStatus,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvitationTokenRequest {
    pub meeting_id: Option<Uuid>,
    pub label: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GuestJoinRequest {
    pub invitation_token: String,
    #[validate(length(min = 1, max = 100))]
    pub display_name: String,
    pub prekey_bundle: String,
}

#[derive(Debug, Serialize)]
pub struct GuestJoinResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MeetingSettingsResponse {
    pub settings: Meeting,
}

#[derive(Debug, Serialize)]
pub struct RsvpCounts {
    pub invited: i64,
    pub accepted: i64,
    pub declined: i64,
    pub tentative: i64,
}
