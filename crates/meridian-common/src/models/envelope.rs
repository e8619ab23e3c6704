//! Envelope Store model — opaque ciphertext fan-out for 1:1 and group chat.
//!
//! The server never inspects payload contents. A 1:1 envelope is addressed
//! to exactly one `(user, device)` pair. A group send is a single `GroupItem`
//! row per message — the sender-key ciphertext is the same for every
//! current member, so there is nothing to fan out at write time; individual
//! members track their own read state in `GroupItemRead`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// One queued ciphertext item awaiting delivery to a specific device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub recipient: Uuid,
    pub recipient_device: Uuid,
    pub sender: Uuid,
    pub sender_device: Uuid,
    pub ciphertext: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

/// One channel send. `item_id` is client-provided and unique — a single row
/// regardless of how many members the channel has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupItem {
    pub item_id: Uuid,
    pub channel_id: Uuid,
    pub sender: Uuid,
    pub sender_device: Uuid,
    pub ciphertext: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

/// Per-`(user, device)` read marker for a `GroupItem`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupItemRead {
    pub item_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendItemRequest {
    /// Client-generated; re-sending the same id to the same device is a no-op.
    pub item_id: Uuid,
    pub recipient: Uuid,
    pub recipient_device: Uuid,
    #[validate(length(min = 1))]
    pub ciphertext: String,
    pub message_type: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendGroupItemRequest {
    /// Client-generated; re-sending the same id to the same channel is a no-op.
    pub item_id: Uuid,
    pub channel_id: Uuid,
    /// Encrypted once under the channel's sender-key — identical for every
    /// current member, so one ciphertext covers the whole send.
    #[validate(length(min = 1))]
    pub ciphertext: String,
    pub message_type: String,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub id: Uuid,
    pub sender: Uuid,
    pub sender_device: Uuid,
    pub ciphertext: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<Item> for ItemResponse {
    fn from(i: Item) -> Self {
        Self {
            id: i.id,
            sender: i.sender,
            sender_device: i.sender_device,
            ciphertext: i.ciphertext,
            message_type: i.message_type,
            created_at: i.created_at,
        }
    }
}

impl From<GroupItem> for ItemResponse {
    fn from(i: GroupItem) -> Self {
        Self {
            id: i.item_id,
            sender: i.sender,
            sender_device: i.sender_device,
            ciphertext: i.ciphertext,
            message_type: i.message_type,
            created_at: i.created_at,
        }
    }
}
