//! Signaling Hub wire events (C7) — the exact event vocabulary clients speak.
//!
//! One tagged enum covers both directions: the `event` field selects the
//! variant, sibling fields carry the payload. Clients send the WebRTC-relay
//! and meeting-specific variants; the hub sends those back out (relayed, with
//! `sourceId` filled in) plus the hub-only variants (`ready`, `joined`,
//! `error`, `knock`, `fileList`, `participants`).

use serde::{Deserialize, Serialize};

/// `message(roomId, type, payload)`'s `type` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingMessageType {
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "mute")]
    Mute,
    #[serde(rename = "unmute")]
    Unmute,
    #[serde(rename = "camon")]
    CamOn,
    #[serde(rename = "camoff")]
    CamOff,
    #[serde(rename = "raisehand")]
    RaiseHand,
    #[serde(rename = "lowerhand")]
    LowerHand,
    #[serde(rename = "emote")]
    Emote,
    #[serde(rename = "screenshare")]
    ScreenShare,
    #[serde(rename = "screenshareoff")]
    ScreenShareOff,
    #[serde(rename = "mediaDevice")]
    MediaDevice,
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "leave")]
    Leave,
}

/// The three room kinds the hub maintains membership maps for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Stream,
    Fileshare,
    Meeting,
}

/// A signaling message, client→hub or hub→client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SignalingMessage {
    // === WebRTC relay (unicast to targetId). `source_id` is absent on the
    // client's outbound message and filled in by the hub before relaying. ===
    #[serde(rename = "offer")]
    Offer {
        target_id: String,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_id: Option<String>,
    },
    #[serde(rename = "answer")]
    Answer {
        target_id: String,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_id: Option<String>,
    },
    #[serde(rename = "candidate")]
    Candidate {
        target_id: String,
        candidate: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_id: Option<String>,
    },

    // === Client -> Hub: room admission & roster (broadcast to room) ===
    /// Viewer/participant requests to join a stream or fileshare room.
    #[serde(rename = "watch")]
    Watch { room_id: String },
    /// File downloader announces interest in a room's file list.
    #[serde(rename = "client")]
    Client { room_id: String, file_name: String },
    /// Host announces itself as the stream source for a room.
    #[serde(rename = "stream")]
    Stream { room_id: String, host_id: String },
    #[serde(rename = "setSlots")]
    SetSlots { room_id: String, n: u32 },
    #[serde(rename = "offerFile")]
    OfferFile { room_id: String, name: String, size: u64 },
    #[serde(rename = "downloadFile")]
    DownloadFile { room_id: String, file_name: String, host_id: String },
    #[serde(rename = "deleteFile")]
    DeleteFile { file_name: String },
    #[serde(rename = "getFiles")]
    GetFiles { room_id: String },
    #[serde(rename = "disconnectPeer")]
    DisconnectPeer { id: String },

    // === Client -> Hub: meetings ===
    #[serde(rename = "joinMeeting")]
    JoinMeeting { room_id: String, name: String },
    #[serde(rename = "leaveMeeting")]
    LeaveMeeting,
    #[serde(rename = "getParticipants")]
    GetParticipants { room_id: String },
    #[serde(rename = "message")]
    Message { room_id: String, r#type: MeetingMessageType, payload: serde_json::Value },

    // === Hub -> Client only ===
    /// Roster/count update after a join, leave, or slot change.
    #[serde(rename = "currentPeers")]
    CurrentPeers { n: usize },
    /// Reply to `getFiles`.
    #[serde(rename = "fileList")]
    FileList { room_id: String, files: Vec<serde_json::Value> },
    /// Reply to `joinMeeting` / `getParticipants`.
    #[serde(rename = "participants")]
    Participants { room_id: String, participants: Vec<serde_json::Value> },
    /// Synthetic roster event the hub emits on disconnect or explicit leave,
    /// and on successful `watch`/`joinMeeting`.
    #[serde(rename = "roster")]
    Roster { room_id: String, client_id: String, joined: bool },
    /// An external guest knocked on a meeting this client can admit into.
    #[serde(rename = "knock")]
    Knock { room_id: String, session_id: String, display_name: String },
    #[serde(rename = "error")]
    Error { code: u32, message: String },
}
