//! Listener Trait

use std::io;
use std::net::SocketAddr;

use super::types::TriggeredAction;
use crate::connection::{DisconnectReason, SessionInfo};

/// Receiver of connection-layer events.
///
/// Implementations are shared by the acceptor and every session, so calls
/// arrive concurrently from different sessions. Calls originating from one
/// session arrive in the order they happened on that session.
///
/// The action callbacks run on the blocking thread pool and may take as
/// long as starting the action takes. Their return value is relayed to the
/// client as the acknowledgment.
pub trait ServerListener: Send + Sync {
    /// The acceptor is bound. `description` is meant for display.
    fn on_listening(&self, _description: &str, _local_addr: SocketAddr) {}

    fn on_bind_failure(&self, _address: &str, _port: u16, _cause: &io::Error) {}

    /// The accept loop died for a reason other than `stop()`
    fn on_fatal_acceptor_error(&self, _cause: &io::Error) {}

    fn on_client_connected(&self, _session: &SessionInfo) {}

    fn on_client_disconnected(&self, _session: &SessionInfo, _reason: &DisconnectReason) {}

    /// Did the normal action start/succeed
    fn on_normal_action_triggered(&self, _action: &TriggeredAction) -> bool {
        false
    }

    /// Did the toggle action accept the requested state
    fn on_toggle_action_triggered(&self, _action: &TriggeredAction, _requested_state: bool) -> bool {
        false
    }
}
