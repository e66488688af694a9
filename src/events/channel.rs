//! Broadcast Channel Listener

use std::io;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::debug;

use super::listener::ServerListener;
use super::types::{ServerEvent, TriggeredAction};
use crate::connection::{DisconnectReason, SessionInfo};

type NormalActionHandler = Box<dyn Fn(&TriggeredAction) -> bool + Send + Sync>;
type ToggleActionHandler = Box<dyn Fn(&TriggeredAction, bool) -> bool + Send + Sync>;

/// Publishes every listener call as a `ServerEvent` on a broadcast channel.
///
/// Action outcomes come from the handlers registered with
/// `with_normal_action_handler` / `with_toggle_action_handler`; without a
/// handler the action is reported as not started.
pub struct ChannelListener {
    events: broadcast::Sender<ServerEvent>,
    normal_handler: Option<NormalActionHandler>,
    toggle_handler: Option<ToggleActionHandler>,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            events,
            normal_handler: None,
            toggle_handler: None,
        }
    }

    pub fn with_normal_action_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TriggeredAction) -> bool + Send + Sync + 'static,
    {
        self.normal_handler = Some(Box::new(handler));
        self
    }

    pub fn with_toggle_action_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TriggeredAction, bool) -> bool + Send + Sync + 'static,
    {
        self.toggle_handler = Some(Box::new(handler));
        self
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ServerEvent) {
        // Nobody listening is not an error
        if self.events.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}

impl Default for ChannelListener {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ServerListener for ChannelListener {
    fn on_listening(&self, description: &str, local_addr: SocketAddr) {
        self.publish(ServerEvent::Listening {
            description: description.to_string(),
            local_addr,
        });
    }

    fn on_bind_failure(&self, address: &str, port: u16, cause: &io::Error) {
        self.publish(ServerEvent::BindFailure {
            address: address.to_string(),
            port,
            cause: cause.to_string(),
        });
    }

    fn on_fatal_acceptor_error(&self, cause: &io::Error) {
        self.publish(ServerEvent::FatalAcceptorError {
            cause: cause.to_string(),
        });
    }

    fn on_client_connected(&self, session: &SessionInfo) {
        self.publish(ServerEvent::ClientConnected {
            session: session.clone(),
        });
    }

    fn on_client_disconnected(&self, session: &SessionInfo, reason: &DisconnectReason) {
        self.publish(ServerEvent::ClientDisconnected {
            session: session.clone(),
            reason: reason.clone(),
        });
    }

    fn on_normal_action_triggered(&self, action: &TriggeredAction) -> bool {
        let success = self
            .normal_handler
            .as_ref()
            .map(|handler| handler(action))
            .unwrap_or(false);
        self.publish(ServerEvent::NormalActionTriggered {
            action: action.clone(),
            success,
        });
        success
    }

    fn on_toggle_action_triggered(&self, action: &TriggeredAction, requested_state: bool) -> bool {
        let success = self
            .toggle_handler
            .as_ref()
            .map(|handler| handler(action, requested_state))
            .unwrap_or(false);
        self.publish(ServerEvent::ToggleActionTriggered {
            action: action.clone(),
            requested_state,
            success,
        });
        success
    }
}
