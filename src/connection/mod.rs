//! Connection Layer
//!
//! Accepts macro-pad clients, tracks them in a registry and drives one
//! session task per client.

pub mod acceptor;
pub mod registry;
pub mod session;
pub mod types;

pub use acceptor::Acceptor;
pub use registry::ConnectionRegistry;
pub use session::{ConnectionSession, SessionHandle, SessionSettings};
pub use types::{
    AcceptorState, AtomicSessionState, ConnectionId, DisconnectReason, ListeningEndpoint,
    SessionInfo, SessionState,
};
