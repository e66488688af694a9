//! Event Types

use serde::Serialize;
use std::net::SocketAddr;

use crate::connection::{ConnectionId, DisconnectReason, SessionInfo};

/// An action pressed on a client device, tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredAction {
    pub connection_id: ConnectionId,
    pub client_name: String,
    pub profile_id: String,
    pub action_id: String,
}

/// Everything the connection layer reports, in publishable form
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Listening {
        description: String,
        local_addr: SocketAddr,
    },
    BindFailure {
        address: String,
        port: u16,
        cause: String,
    },
    FatalAcceptorError {
        cause: String,
    },
    ClientConnected {
        session: SessionInfo,
    },
    ClientDisconnected {
        session: SessionInfo,
        reason: DisconnectReason,
    },
    NormalActionTriggered {
        action: TriggeredAction,
        success: bool,
    },
    ToggleActionTriggered {
        action: TriggeredAction,
        requested_state: bool,
        success: bool,
    },
}

impl ServerEvent {
    /// Connection the event belongs to, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            ServerEvent::ClientConnected { session } => Some(session.id),
            ServerEvent::ClientDisconnected { session, .. } => Some(session.id),
            ServerEvent::NormalActionTriggered { action, .. } => Some(action.connection_id),
            ServerEvent::ToggleActionTriggered { action, .. } => Some(action.connection_id),
            _ => None,
        }
    }
}
