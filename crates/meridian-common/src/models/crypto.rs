//! Signal Protocol key-directory domain models.
//!
//! The server is deliberately blind to plaintext and session state: it
//! stores only public key material, keyed by `clientid` (see
//! `models::client::Client`), and opaque ciphertext envelopes keyed by
//! `(user, device)`.
//!
//! ```text
//! Registration:
//!   client -> server: one-time pre-keys (X25519 public × N)
//!                      signed pre-key (X25519 public + signature)
//!
//! Key Exchange (X3DH):
//!   initiator fetches recipient's key bundle; the server marks the
//!   consumed one-time pre-key as used (delete-then-return, exactly once)
//!
//! Group fan-out:
//!   each group member uploads one sender-key per channel; the server
//!   only stores and serves it, rotation is the client's responsibility
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One uploaded, unconsumed one-time pre-key. Unique on `(client, prekey_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub client_id: Uuid,
    pub owner: Uuid,
    pub prekey_id: i32,
    pub prekey_data: String,
}

/// The current signed pre-key for a client. Overwritable on rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub client_id: Uuid,
    pub owner: Uuid,
    pub signed_prekey_id: i32,
    pub signed_prekey_data: String,
    pub signed_prekey_signature: String,
    pub updated_at: DateTime<Utc>,
}

/// A group sender-key, keyed by `(channel, client)`. Signal channels only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKey {
    pub channel_id: Uuid,
    pub client_id: Uuid,
    pub owner: Uuid,
    pub sender_key: String,
    pub updated_at: DateTime<Utc>,
}

/// Full key bundle returned to an X3DH initiator — identity public key
/// (the client's own `public_key`), current signed pre-key, and at most one
/// one-time pre-key (consumed on fetch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    pub client_id: Uuid,
    pub owner: Uuid,
    pub identity_key: Option<String>,
    pub signed_prekey_id: i32,
    pub signed_prekey_data: String,
    pub signed_prekey_signature: String,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub prekey_id: i32,
    pub prekey_data: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadPreKeysRequest {
    pub keys: Vec<PreKeyUpload>,
}

#[derive(Debug, Deserialize)]
pub struct PreKeyUpload {
    pub prekey_id: i32,
    pub prekey_data: String,
}

#[derive(Debug, Deserialize)]
pub struct RotateSignedPreKeyRequest {
    pub signed_prekey_id: i32,
    pub signed_prekey_data: String,
    pub signed_prekey_signature: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadSenderKeyRequest {
    pub sender_key: String,
}

#[derive(Debug, Serialize)]
pub struct PreKeyCountResponse {
    pub client_id: Uuid,
    pub remaining: i64,
}

/// Safety number — a human-verifiable fingerprint of two identity keys,
/// computed server-side from public material but compared out-of-band by users.
#[derive(Debug, Serialize)]
pub struct SafetyNumberResponse {
    pub local_identity_key: String,
    pub remote_identity_key: String,
    pub fingerprint: String,
}
