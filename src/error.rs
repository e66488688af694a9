//! Error Types
//!
//! Typed errors for the connection layer. Application plumbing (config,
//! binary, management API) keeps using `anyhow` on top of these.

use std::io;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors surfaced by the acceptor, registry and session handles
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid endpoint: port {port} is outside 0..=65535")]
    InvalidEndpoint { port: u32 },

    #[error("acceptor is already running")]
    AlreadyRunning,

    #[error("failed to bind {address}:{port}: {source}")]
    BindFailure {
        address: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("connection {0} is already registered")]
    DuplicateIdentity(ConnectionId),

    #[error("session {0} is closed")]
    SessionClosed(ConnectionId),

    #[error("acceptor stopped unexpectedly: {0}")]
    UnexpectedAcceptor(#[source] io::Error),
}

/// Wire-level errors; each one is scoped to the session that produced it
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("connection closed mid-frame")]
    TruncatedFrame,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True for transport failures as opposed to malformed input
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}
