//! Channel model — an E2EE-messaging or WebRTC signaling room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A channel. The owner implicitly holds `"*"` on their own channel
/// regardless of assigned role (see `permissions::member_has_permission`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner: Uuid,
    pub private: bool,
    pub channel_type: ChannelType,
    pub default_role_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Group E2EE messaging channel (Sender-Key fan-out).
    Signal,
    /// WebRTC signaling room (meeting / stream / fileshare).
    Webrtc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMember {
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateChannelRequest {
    #[validate(length(min = 1, max = 100, message = "Channel name must be 1-100 characters"))]
    pub name: String,
    #[validate(length(max = 1024))]
    pub description: Option<String>,
    pub channel_type: ChannelType,
    pub private: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
}
