//! Refresh tokens and HMAC client sessions — the durable half of the C3
//! auth state machine. The hand-off JWT itself is stateless (see
//! [`crate::auth`]); only its one-shot `jti` blacklist is persisted here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A single-use refresh token. Reuse after `used_at` is set is a replay —
/// the caller must destroy the token and fail the request.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub rotation_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A native client's HMAC-signing session. `session_secret` is a 32-byte
/// value, base64/hex-encoded; only the owning `clientId` ever writes its row.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: Uuid,
    pub session_secret: String,
    pub user_id: Uuid,
    pub device_id: i64,
    pub expires_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub device_info: Option<String>,
}
