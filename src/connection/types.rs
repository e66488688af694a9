//! Connection Layer Types

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::SystemTime;

use crate::protocol::ClientHello;

/// Identity of one accepted connection.
///
/// Derived from the peer address plus a per-process accept serial, so a
/// client reconnecting from the same address still gets a new identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId {
    serial: u64,
    remote: SocketAddr,
}

impl ConnectionId {
    pub fn new(serial: u64, remote: SocketAddr) -> Self {
        Self { serial, remote }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.serial)
    }
}

/// Session lifecycle. Variants are ordered; a session only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Handshaking = 1,
    Active = 2,
    Disconnecting = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Handshaking,
            2 => SessionState::Active,
            3 => SessionState::Disconnecting,
            _ => SessionState::Closed,
        }
    }
}

/// Lock-free holder for a `SessionState` that refuses backward moves
#[derive(Debug)]
pub struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns true when this call performed the transition.
    pub fn advance(&self, next: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < next as u8).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Why a session left the Active phase (or never reached it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Client sent a disconnect notice
    ClientRequested(String),
    /// Client closed the socket without a notice
    PeerClosed,
    HandshakeFailure(String),
    KeepAliveTimeout,
    Io(String),
    Protocol(String),
    /// Administrator disconnected this client
    ServerRequested,
    ServerShutdown,
}

impl DisconnectReason {
    /// Short label, used as a metrics dimension
    pub fn label(&self) -> &'static str {
        match self {
            DisconnectReason::ClientRequested(_) => "client_requested",
            DisconnectReason::PeerClosed => "peer_closed",
            DisconnectReason::HandshakeFailure(_) => "handshake_failure",
            DisconnectReason::KeepAliveTimeout => "keepalive_timeout",
            DisconnectReason::Io(_) => "io_error",
            DisconnectReason::Protocol(_) => "protocol_error",
            DisconnectReason::ServerRequested => "server_requested",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }

    /// Reasons for which the server tells the client before closing
    pub fn is_server_initiated(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ServerRequested
                | DisconnectReason::ServerShutdown
                | DisconnectReason::KeepAliveTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientRequested(reason) if reason.is_empty() => {
                write!(f, "client requested disconnect")
            }
            DisconnectReason::ClientRequested(reason) => {
                write!(f, "client requested disconnect: {}", reason)
            }
            DisconnectReason::PeerClosed => write!(f, "peer closed connection"),
            DisconnectReason::HandshakeFailure(reason) => write!(f, "handshake failed: {}", reason),
            DisconnectReason::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            DisconnectReason::Io(reason) => write!(f, "i/o error: {}", reason),
            DisconnectReason::Protocol(reason) => write!(f, "protocol error: {}", reason),
            DisconnectReason::ServerRequested => write!(f, "disconnected by server"),
            DisconnectReason::ServerShutdown => write!(f, "server shutting down"),
        }
    }
}

/// Point-in-time view of a session, safe to hand to presentation code
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    pub client: Option<ClientHello>,
    /// Set once the client connected event has been published
    pub connected: bool,
    pub accepted_at: SystemTime,
    pub idle_ms: u64,
}

impl SessionInfo {
    /// Client display name, if the handshake completed
    pub fn client_name(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.client_name.as_str())
    }
}

/// Acceptor lifecycle as seen by management code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptorState {
    Stopped,
    Starting,
    Listening,
}

/// Bind address and port. An empty address means all interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningEndpoint {
    pub bind_address: String,
    pub port: u16,
}

impl ListeningEndpoint {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
        }
    }

    pub fn is_all_interfaces(&self) -> bool {
        self.bind_address.trim().is_empty()
    }
}

impl Default for ListeningEndpoint {
    fn default() -> Self {
        Self::new("", 0)
    }
}
