//! User and WebAuthn credential models.
//!
//! Users are passwordless by design: registration and login both run through
//! OTP, WebAuthn, backup codes, or a magic link, never a stored password.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A registered user. Created on first `/register` (`verified=false`);
/// `verified` flips to true on the first successful OTP and never back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub verified: bool,
    pub display_name: Option<String>,
    pub at_name: Option<String>,
    pub credentials: Vec<WebAuthnCredential>,
    pub backup_codes: Vec<BackupCode>,
    pub picture: Option<String>,
    pub active: bool,
    pub notification_prefs: NotificationPrefs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationPrefs {
    pub email_enabled: bool,
    pub push_enabled: bool,
}

/// A WebAuthn (passkey) credential embedded in a user's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    /// base64url credential ID.
    pub id: String,
    /// Serialized passkey material — opaque to everything but `webauthn-rs`.
    pub passkey_json: String,
    pub transports: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub browser: Option<String>,
    pub ip: Option<String>,
    pub location: Option<String>,
}

/// One backup code in a user's 10-code set. Stored only as a bcrypt hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCode {
    pub hash: String,
    pub used: bool,
}

/// Registration request — email plus optional invitation token for
/// `invitation_only` registration mode.
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    pub invitation_token: Option<String>,
}

/// OTP verification request.
#[derive(Debug, Deserialize, Validate)]
pub struct OtpVerifyRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(equal = 5))]
    pub otp: String,
    pub client_id: Option<Uuid>,
}

/// Profile update request — `displayName`/`atName`/`picture` only; email and
/// credentials change through their own dedicated flows.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(length(min = 1, max = 80))]
    pub display_name: Option<String>,
    #[validate(length(min = 1, max = 32))]
    pub at_name: Option<String>,
    pub picture: Option<String>,
}

/// Public-facing user projection — never includes credential or backup-code material.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub verified: bool,
    pub display_name: Option<String>,
    pub at_name: Option<String>,
    pub picture: Option<String>,
    pub active: bool,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            verified: u.verified,
            display_name: u.display_name,
            at_name: u.at_name,
            picture: u.picture,
            active: u.active,
        }
    }
}
