#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages.
///
/// SDP and ICE payloads are opaque `Value`s: the relay routes them, it never
/// inspects or rewrites them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a numbered room. Without `meeting_id` the user's personal
    /// meeting identity is used.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_number: u8,
        #[serde(default)]
        meeting_id: Option<String>,
    },
    /// Leave a room
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        room_number: u8,
    },
    /// Push-to-talk pressed
    #[serde(rename_all = "camelCase")]
    PushToTalkStart {
        room_number: u8,
    },
    /// Push-to-talk released
    #[serde(rename_all = "camelCase")]
    PushToTalkEnd {
        room_number: u8,
    },
    /// Relay an SDP offer to one connection
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        target_connection_id: String,
        offer: Value,
    },
    /// Relay an SDP answer to one connection
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        target_connection_id: String,
        answer: Value,
    },
    /// Relay an ICE candidate to one connection
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        target_connection_id: String,
        candidate: Value,
    },
    /// Mute or unmute a participant (admin only)
    #[serde(rename_all = "camelCase")]
    AdminMute {
        room_number: u8,
        meeting_id: String,
        muted: bool,
    },
    /// Remove a participant from a room (admin only)
    #[serde(rename_all = "camelCase")]
    AdminRemove {
        room_number: u8,
        meeting_id: String,
    },
    /// Silently observe a room's broadcasts (admin only)
    #[serde(rename_all = "camelCase")]
    AdminMonitor {
        room_number: u8,
    },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Room joined successfully; roster includes the joiner
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_number: u8,
        participants: Vec<ParticipantInfo>,
    },
    /// Another participant joined the room
    ParticipantJoined {
        participant: ParticipantInfo,
    },
    /// A participant left the room
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        meeting_id: String,
        name: String,
    },
    /// Current room occupancy
    #[serde(rename_all = "camelCase")]
    ParticipantCount {
        room_number: u8,
        count: usize,
    },
    /// Push-to-talk state of another participant
    #[serde(rename_all = "camelCase")]
    UserSpeaking {
        meeting_id: String,
        name: String,
        speaking: bool,
    },
    /// A participant was muted or unmuted by an admin
    #[serde(rename_all = "camelCase")]
    ParticipantMuted {
        meeting_id: String,
        muted: bool,
        by: String,
    },
    /// A participant was removed by an admin
    #[serde(rename_all = "camelCase")]
    ParticipantRemoved {
        meeting_id: String,
        by: String,
    },
    /// Incoming SDP offer, tagged with the sender
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        from: String,
        from_meeting_id: String,
        offer: Value,
    },
    /// Incoming SDP answer, tagged with the sender
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        from: String,
        from_meeting_id: String,
        answer: Value,
    },
    /// Incoming ICE candidate, tagged with the sender
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        from: String,
        from_meeting_id: String,
        candidate: Value,
    },
    /// Monitor subscription confirmed
    #[serde(rename_all = "camelCase")]
    MonitorStarted {
        room_number: u8,
    },
    /// Error response, delivered only to the caller
    Error {
        message: String,
    },
}

/// Participant entry as seen on the wire (rosters and join notifications).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub meeting_id: String,
    pub name: String,
    pub connection_id: String,
    pub muted: bool,
}
