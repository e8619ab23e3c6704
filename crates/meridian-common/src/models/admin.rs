//! Server Admin model — single-row server settings and signup invitations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which gate `/register` evaluates before issuing an OTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// Any email may register.
    Open,
    /// Email domain must end with one of `allowed_email_suffixes`.
    EmailSuffix,
    /// Requires a matching unexpired, unused `Invitation(email, token)`.
    InvitationOnly,
}

impl RegistrationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::EmailSuffix => "email_suffix",
            Self::InvitationOnly => "invitation_only",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "email_suffix" => Self::EmailSuffix,
            "invitation_only" => Self::InvitationOnly,
            _ => Self::Open,
        }
    }
}

/// Single-row table; `id` is always `1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub id: i64,
    pub server_name: String,
    pub server_picture: Option<String>,
    pub registration_mode: RegistrationMode,
    pub allowed_email_suffixes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            id: 1,
            server_name: "Meridian".to_string(),
            server_picture: None,
            registration_mode: RegistrationMode::Open,
            allowed_email_suffixes: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// A 6-character signup invitation token, distinct from meeting invitation tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub email: String,
    pub token: String,
    pub created_by: Uuid,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServerSettingsRequest {
    pub server_name: Option<String>,
    pub server_picture: Option<String>,
    pub registration_mode: Option<RegistrationMode>,
    pub allowed_email_suffixes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvitationRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct InvitationResponse {
    pub email: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyInvitationRequest {
    pub email: String,
    pub token: String,
}
