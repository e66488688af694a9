//! Wire Protocol Types

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::constants::*;

/// Profile advertised by a client during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
}

/// Client screen geometry, used by presentation code to lay out grids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

/// Identification sent by a client as its first frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_name: String,
    pub client_version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub profiles: Vec<ProfileSummary>,
    #[serde(default)]
    pub screen: Option<ScreenSize>,
}

/// Server reply to an accepted handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_name: String,
    pub server_version: String,
    pub connection_id: String,
    pub keepalive_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
}

/// A normal action pressed on the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub profile_id: String,
    pub action_id: String,
}

/// A toggle action pressed on the client, carrying the requested state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleRequest {
    pub profile_id: String,
    pub action_id: String,
    pub toggle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAck {
    pub action_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleAck {
    pub action_id: String,
    pub toggle: bool,
    pub success: bool,
}

/// One cell of an action grid pushed to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSlot {
    pub action_id: String,
    pub row: u32,
    pub col: u32,
    #[serde(default)]
    pub display_text: Option<String>,
    #[serde(default)]
    pub toggle: Option<bool>,
}

/// Full grid layout for one client profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGrid {
    pub profile_id: String,
    pub rows: u32,
    pub cols: u32,
    #[serde(default)]
    pub slots: Vec<ActionSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleState {
    pub profile_id: String,
    pub action_id: String,
    pub toggle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub reason: String,
}

/// Every message that can travel inside a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(ClientHello),
    HandshakeAccepted(ServerHello),
    HandshakeRejected(Rejection),
    NormalAction(ActionRequest),
    ToggleAction(ToggleRequest),
    ActionAck(ActionAck),
    ToggleAck(ToggleAck),
    KeepAlive,
    GridUpdate(ActionGrid),
    ToggleState(ToggleState),
    Disconnect(DisconnectNotice),
}

impl Message {
    /// Get the kind code for this message
    pub fn kind(&self) -> u8 {
        match self {
            Message::Handshake(_) => MSG_HANDSHAKE,
            Message::HandshakeAccepted(_) => MSG_HANDSHAKE_ACCEPTED,
            Message::HandshakeRejected(_) => MSG_HANDSHAKE_REJECTED,
            Message::NormalAction(_) => MSG_NORMAL_ACTION,
            Message::ToggleAction(_) => MSG_TOGGLE_ACTION,
            Message::ActionAck(_) => MSG_ACTION_ACK,
            Message::ToggleAck(_) => MSG_TOGGLE_ACK,
            Message::KeepAlive => MSG_KEEP_ALIVE,
            Message::GridUpdate(_) => MSG_GRID_UPDATE,
            Message::ToggleState(_) => MSG_TOGGLE_STATE,
            Message::Disconnect(_) => MSG_DISCONNECT,
        }
    }

    /// Human-readable kind name for logs and errors
    pub fn kind_name(&self) -> &'static str {
        kind_name(self.kind())
    }

    /// Serialize the payload half of the frame
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let kind = self.kind_name();
        let wrap = |source| ProtocolError::InvalidPayload { kind, source };
        match self {
            Message::Handshake(p) => serde_json::to_vec(p).map_err(wrap),
            Message::HandshakeAccepted(p) => serde_json::to_vec(p).map_err(wrap),
            Message::HandshakeRejected(p) => serde_json::to_vec(p).map_err(wrap),
            Message::NormalAction(p) => serde_json::to_vec(p).map_err(wrap),
            Message::ToggleAction(p) => serde_json::to_vec(p).map_err(wrap),
            Message::ActionAck(p) => serde_json::to_vec(p).map_err(wrap),
            Message::ToggleAck(p) => serde_json::to_vec(p).map_err(wrap),
            Message::KeepAlive => Ok(Vec::new()),
            Message::GridUpdate(p) => serde_json::to_vec(p).map_err(wrap),
            Message::ToggleState(p) => serde_json::to_vec(p).map_err(wrap),
            Message::Disconnect(p) => serde_json::to_vec(p).map_err(wrap),
        }
    }

    /// Rebuild a message from its kind code and payload bytes
    pub fn decode(kind: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: u8,
            payload: &[u8],
        ) -> Result<T, ProtocolError> {
            serde_json::from_slice(payload).map_err(|source| ProtocolError::InvalidPayload {
                kind: kind_name(kind),
                source,
            })
        }

        let message = match kind {
            MSG_HANDSHAKE => Message::Handshake(parse(kind, payload)?),
            MSG_HANDSHAKE_ACCEPTED => Message::HandshakeAccepted(parse(kind, payload)?),
            MSG_HANDSHAKE_REJECTED => Message::HandshakeRejected(parse(kind, payload)?),
            MSG_NORMAL_ACTION => Message::NormalAction(parse(kind, payload)?),
            MSG_TOGGLE_ACTION => Message::ToggleAction(parse(kind, payload)?),
            MSG_ACTION_ACK => Message::ActionAck(parse(kind, payload)?),
            MSG_TOGGLE_ACK => Message::ToggleAck(parse(kind, payload)?),
            // Keep-alive carries no payload; trailing bytes are ignored
            MSG_KEEP_ALIVE => Message::KeepAlive,
            MSG_GRID_UPDATE => Message::GridUpdate(parse(kind, payload)?),
            MSG_TOGGLE_STATE => Message::ToggleState(parse(kind, payload)?),
            MSG_DISCONNECT => Message::Disconnect(parse(kind, payload)?),
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        Ok(message)
    }
}

/// Name for a kind code, "unknown" for codes outside the message set
pub fn kind_name(kind: u8) -> &'static str {
    match kind {
        MSG_HANDSHAKE => "handshake",
        MSG_HANDSHAKE_ACCEPTED => "handshake-accepted",
        MSG_HANDSHAKE_REJECTED => "handshake-rejected",
        MSG_NORMAL_ACTION => "normal-action",
        MSG_TOGGLE_ACTION => "toggle-action",
        MSG_ACTION_ACK => "action-ack",
        MSG_TOGGLE_ACK => "toggle-ack",
        MSG_KEEP_ALIVE => "keep-alive",
        MSG_GRID_UPDATE => "grid-update",
        MSG_TOGGLE_STATE => "toggle-state",
        MSG_DISCONNECT => "disconnect",
        _ => "unknown",
    }
}
