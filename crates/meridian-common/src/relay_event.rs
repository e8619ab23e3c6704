//! Relay event types — shared between the API and the Signaling Hub.
//!
//! The REST layer emits one of these when it needs to push something onto a
//! connected client's persistent stream (currently: a meeting knock). This
//! module lives here, rather than in either crate, so both can share the
//! wire shape without a circular dependency.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event pushed through the Signaling Hub to one or more connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Event name, e.g. `"knock"`.
    pub event_type: String,
    /// Event payload, opaque JSON forwarded verbatim to the client.
    pub data: serde_json::Value,
    /// Which channel/room this event belongs to, if any (for room fan-out).
    pub channel_id: Option<Uuid>,
    /// Which user triggered this event.
    pub user_id: Option<Uuid>,
}

impl RelayEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            channel_id: None,
            user_id: None,
        }
    }

    pub fn with_channel(mut self, channel_id: Uuid) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}
