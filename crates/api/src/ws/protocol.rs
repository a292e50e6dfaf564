use consulta_services::live::registry::Role;
use serde::{Deserialize, Serialize};

/// Control frames accepted from clients. Binary WebSocket frames carry raw
/// audio and never reach this enum. Unknown `type` values and missing
/// fields fail deserialization and are rejected at the boundary; extra
/// fields are tolerated so older relays survive newer clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Host handshake; `token` is a platform-issued access token.
    #[serde(rename_all = "camelCase")]
    Hello {
        token: String,
        mime_type: String,
        sample_rate: u32,
    },
    /// Patient handshake with the credentials the host shared out-of-band.
    #[serde(rename_all = "camelCase")]
    HelloPatient {
        room_id: String,
        join_token: String,
        mime_type: String,
        sample_rate: u32,
    },
    Ping {
        #[serde(default)]
        ts: Option<i64>,
    },
    Pong {
        #[serde(default)]
        ts: Option<i64>,
    },
    /// Graceful end of the session.
    Done,
    /// Patient-only: leave and tell the host explicitly.
    Disconnect,
}

/// Control frames sent to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted. `join_token` is disclosed to the host only.
    #[serde(rename_all = "camelCase")]
    Ready {
        role: Role,
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        join_token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PatientJoined { room_id: String },
    #[serde(rename_all = "camelCase")]
    PatientStatus {
        room_id: String,
        connected: bool,
        reason: String,
    },
    /// Interim hypothesis — host-only live monitoring.
    #[serde(rename_all = "camelCase")]
    Partial {
        room_id: String,
        speaker: Role,
        text: String,
    },
    /// Finalized utterance — broadcast to both peers.
    #[serde(rename_all = "camelCase")]
    Turn {
        room_id: String,
        speaker: Role,
        text: String,
        ts: i64,
    },
    Ping { ts: i64 },
    Pong { ts: i64 },
    Error { message: String },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}
