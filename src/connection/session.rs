//! Connection Session
//!
//! Owns one client socket from accept to close: handshake, framed read
//! loop, keep-alive supervision, action dispatch and teardown. Outbound
//! frames go through a bounded queue drained by a single writer task, so
//! writes from the session itself and from management code never
//! interleave on the socket.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn, Instrument};

use super::registry::ConnectionRegistry;
use super::types::{
    AtomicSessionState, ConnectionId, DisconnectReason, SessionInfo, SessionState,
};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::events::{ServerListener, TriggeredAction};
use crate::protocol::{
    ActionAck, ActionGrid, ActionRequest, ClientHello, DisconnectNotice, FrameReader,
    FrameWriter, Message, Rejection, ServerHello, ToggleAck, ToggleRequest, ToggleState,
    DEFAULT_MAX_FRAME_LENGTH,
};

/// Per-session tunables, shared by every session an acceptor creates
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server_name: String,
    pub handshake_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_length: usize,
    pub outbound_queue_capacity: usize,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            server_name: config.server_name.clone(),
            handshake_timeout: config.handshake_timeout,
            keepalive_timeout: config.keepalive_timeout,
            write_timeout: config.write_timeout,
            max_frame_length: config.max_frame_length,
            outbound_queue_capacity: config.outbound_queue_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_name: "macropad-server".to_string(),
            handshake_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            outbound_queue_capacity: 64,
        }
    }
}

/// Shared view of a session, held by the registry and by management code.
///
/// The socket itself stays with the session task; the handle only carries
/// state, the outbound queue and the close signal.
#[derive(Debug)]
pub struct SessionHandle {
    id: ConnectionId,
    state: AtomicSessionState,
    client: RwLock<Option<ClientHello>>,
    connected: AtomicBool,
    accepted_at: SystemTime,
    last_activity: Mutex<Instant>,
    outbound: mpsc::Sender<Message>,
    close_tx: watch::Sender<Option<DisconnectReason>>,
}

impl SessionHandle {
    /// Build a handle together with the receiving ends its session drives
    pub(crate) fn new(
        id: ConnectionId,
        queue_capacity: usize,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Message>,
        watch::Receiver<Option<DisconnectReason>>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Arc::new(Self {
            id,
            state: AtomicSessionState::new(SessionState::Connecting),
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
            accepted_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
            outbound,
            close_tx,
        });
        (handle, outbound_rx, close_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Client identification, available once the handshake completed
    pub fn client(&self) -> Option<ClientHello> {
        self.client.read().clone()
    }

    /// Whether the client connected event was published for this session
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_addr: self.id.remote_addr(),
            state: self.state(),
            client: self.client(),
            connected: self.is_connected(),
            accepted_at: self.accepted_at,
            idle_ms: self.idle().as_millis() as u64,
        }
    }

    /// Queue a message for the writer task, waiting for room if needed
    pub async fn send(&self, message: Message) -> Result<(), ServerError> {
        if self.state() >= SessionState::Disconnecting {
            return Err(ServerError::SessionClosed(self.id));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ServerError::SessionClosed(self.id))
    }

    /// Queue a message without waiting; a full queue counts as closed
    pub fn try_send(&self, message: Message) -> Result<(), ServerError> {
        if self.state() >= SessionState::Disconnecting {
            return Err(ServerError::SessionClosed(self.id));
        }
        self.outbound
            .try_send(message)
            .map_err(|_| ServerError::SessionClosed(self.id))
    }

    /// Push an updated action grid to the client
    pub async fn push_grid(&self, grid: ActionGrid) -> Result<(), ServerError> {
        self.send(Message::GridUpdate(grid)).await
    }

    /// Tell the client about a toggle state changed on the server side
    pub async fn push_toggle_state(&self, state: ToggleState) -> Result<(), ServerError> {
        self.send(Message::ToggleState(state)).await
    }

    /// Request teardown. The first request wins; returns whether this one did.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Reason of a pending close request, if any
    pub fn close_requested(&self) -> Option<DisconnectReason> {
        self.close_tx.borrow().clone()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn set_client(&self, hello: ClientHello) {
        *self.client.write() = Some(hello);
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn advance(&self, next: SessionState) -> bool {
        self.state.advance(next)
    }

    fn outbound(&self) -> &mpsc::Sender<Message> {
        &self.outbound
    }
}

/// Server side of one client connection
pub struct ConnectionSession {
    handle: Arc<SessionHandle>,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    outbound_rx: mpsc::Receiver<Message>,
    close_rx: watch::Receiver<Option<DisconnectReason>>,
    registry: Arc<ConnectionRegistry>,
    listener: Arc<dyn ServerListener>,
    settings: Arc<SessionSettings>,
}

impl ConnectionSession {
    /// Wrap an accepted socket. The session starts in `Connecting`.
    pub fn new(
        stream: TcpStream,
        id: ConnectionId,
        registry: Arc<ConnectionRegistry>,
        listener: Arc<dyn ServerListener>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection_id = %id, "Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (handle, outbound_rx, close_rx) =
            SessionHandle::new(id, settings.outbound_queue_capacity);

        Self {
            handle,
            reader: FrameReader::with_max_frame_length(read_half, settings.max_frame_length),
            writer: FrameWriter::new(write_half),
            outbound_rx,
            close_rx,
            registry,
            listener,
            settings,
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        Arc::clone(&self.handle)
    }

    /// Drive the session until it is closed. Consumes the session.
    #[instrument(
        name = "session",
        skip(self),
        fields(connection_id = %self.handle.id(), peer = %self.handle.id().remote_addr())
    )]
    pub async fn run(self) {
        let ConnectionSession {
            handle,
            reader,
            writer,
            outbound_rx,
            close_rx,
            registry,
            listener,
            settings,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let writer_task = tokio::spawn(
            write_loop(
                writer,
                outbound_rx,
                stop_rx,
                Arc::clone(&handle),
                settings.write_timeout,
            )
            .in_current_span(),
        );

        let mut driver = SessionDriver {
            handle,
            reader,
            close_rx,
            listener,
            settings,
        };
        let reason = driver.drive().await;
        driver.teardown(reason, registry, writer_task, stop_tx).await;
    }
}

/// Read-side state of a running session
struct SessionDriver {
    handle: Arc<SessionHandle>,
    reader: FrameReader<OwnedReadHalf>,
    close_rx: watch::Receiver<Option<DisconnectReason>>,
    listener: Arc<dyn ServerListener>,
    settings: Arc<SessionSettings>,
}

impl SessionDriver {
    async fn drive(&mut self) -> DisconnectReason {
        self.handle.advance(SessionState::Handshaking);

        let hello = match self.handshake().await {
            Ok(hello) => hello,
            Err(reason) => return reason,
        };

        let client_name = hello.client_name.clone();
        if !self.handle.advance(SessionState::Active) {
            return self.requested_reason();
        }
        self.handle.touch();

        let accepted = Message::HandshakeAccepted(ServerHello {
            server_name: self.settings.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            connection_id: self.handle.id().to_string(),
            keepalive_interval_ms: (self.settings.keepalive_timeout / 2).as_millis() as u64,
        });
        if let Err(reason) = self.reply(accepted).await {
            return reason;
        }

        // Client and flag are published together with the connected event
        self.handle.set_client(hello);
        self.handle.mark_connected();
        info!("Client '{}' connected", client_name);
        self.listener.on_client_connected(&self.handle.info());

        self.active_loop().await
    }

    async fn handshake(&mut self) -> Result<ClientHello, DisconnectReason> {
        let deadline = self.settings.handshake_timeout;
        let read = tokio::select! {
            biased;
            _ = self.close_rx.changed() => None,
            read = timeout(deadline, self.reader.read_message()) => Some(read),
        };

        let message = match read {
            None => return Err(self.requested_reason()),
            Some(Err(_)) => return Err(self.reject(format!("no handshake within {:?}", deadline))),
            Some(Ok(Ok(Some(message)))) => message,
            Some(Ok(Ok(None))) => {
                return Err(DisconnectReason::HandshakeFailure(
                    "connection closed before handshake".to_string(),
                ))
            }
            Some(Ok(Err(e))) => return Err(self.reject(format!("malformed handshake: {}", e))),
        };

        match message {
            Message::Handshake(hello) if hello.client_name.trim().is_empty() => {
                Err(self.reject("client name is empty"))
            }
            Message::Handshake(hello) => {
                debug!(
                    "Handshake from '{}' v{} on {}",
                    hello.client_name, hello.client_version, hello.platform
                );
                Ok(hello)
            }
            other => Err(self.reject(format!("expected handshake, got {}", other.kind_name()))),
        }
    }

    /// Best-effort rejection notice, then the failure reason
    fn reject(&self, reason: impl Into<String>) -> DisconnectReason {
        let reason = reason.into();
        warn!("Handshake failed: {}", reason);
        if self
            .handle
            .outbound()
            .try_send(Message::HandshakeRejected(Rejection {
                reason: reason.clone(),
            }))
            .is_err()
        {
            debug!("Could not queue handshake rejection");
        }
        DisconnectReason::HandshakeFailure(reason)
    }

    async fn active_loop(&mut self) -> DisconnectReason {
        let keepalive = self.settings.keepalive_timeout;
        loop {
            let read = tokio::select! {
                biased;
                _ = self.close_rx.changed() => None,
                read = timeout(keepalive, self.reader.read_message()) => Some(read),
            };

            let message = match read {
                None => return self.requested_reason(),
                Some(Err(_)) => {
                    warn!("No traffic for {:?}, treating connection as dead", keepalive);
                    return DisconnectReason::KeepAliveTimeout;
                }
                Some(Ok(Ok(Some(message)))) => message,
                Some(Ok(Ok(None))) => return DisconnectReason::PeerClosed,
                Some(Ok(Err(e))) if e.is_io() => return DisconnectReason::Io(e.to_string()),
                Some(Ok(Err(e))) => {
                    warn!("Dropping client after malformed frame: {}", e);
                    return DisconnectReason::Protocol(e.to_string());
                }
            };
            self.handle.touch();

            let response = match message {
                Message::KeepAlive => Message::KeepAlive,
                Message::NormalAction(request) => self.dispatch_normal(request).await,
                Message::ToggleAction(request) => self.dispatch_toggle(request).await,
                Message::Disconnect(notice) => {
                    return DisconnectReason::ClientRequested(notice.reason);
                }
                other => {
                    warn!("Unexpected {} message from client", other.kind_name());
                    return DisconnectReason::Protocol(format!(
                        "unexpected {} message",
                        other.kind_name()
                    ));
                }
            };

            if let Err(reason) = self.reply(response).await {
                return reason;
            }
        }
    }

    fn triggered(&self, profile_id: String, action_id: String) -> TriggeredAction {
        TriggeredAction {
            connection_id: self.handle.id(),
            client_name: self
                .handle
                .client()
                .map(|c| c.client_name)
                .unwrap_or_default(),
            profile_id,
            action_id,
        }
    }

    async fn dispatch_normal(&self, request: ActionRequest) -> Message {
        let action_id = request.action_id.clone();
        let action = self.triggered(request.profile_id, request.action_id);
        let listener = Arc::clone(&self.listener);

        debug!("Normal action '{}' triggered", action_id);
        let success =
            match tokio::task::spawn_blocking(move || listener.on_normal_action_triggered(&action))
                .await
            {
                Ok(success) => success,
                Err(e) => {
                    warn!("Action handler for '{}' failed: {}", action_id, e);
                    false
                }
            };
        if !success {
            debug!("Action '{}' reported failure", action_id);
        }

        Message::ActionAck(ActionAck { action_id, success })
    }

    async fn dispatch_toggle(&self, request: ToggleRequest) -> Message {
        let action_id = request.action_id.clone();
        let toggle = request.toggle;
        let action = self.triggered(request.profile_id, request.action_id);
        let listener = Arc::clone(&self.listener);

        debug!("Toggle action '{}' triggered -> {}", action_id, toggle);
        let success = match tokio::task::spawn_blocking(move || {
            listener.on_toggle_action_triggered(&action, toggle)
        })
        .await
        {
            Ok(success) => success,
            Err(e) => {
                warn!("Toggle handler for '{}' failed: {}", action_id, e);
                false
            }
        };

        Message::ToggleAck(ToggleAck {
            action_id,
            toggle,
            success,
        })
    }

    /// Queue a response, giving up if a close is requested meanwhile
    async fn reply(&mut self, message: Message) -> Result<(), DisconnectReason> {
        let outbound = self.handle.outbound().clone();
        let sent = tokio::select! {
            biased;
            _ = self.close_rx.changed() => None,
            sent = outbound.send(message) => Some(sent),
        };
        match sent {
            None => Err(self.requested_reason()),
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(DisconnectReason::Io("writer stopped".to_string())),
        }
    }

    fn requested_reason(&self) -> DisconnectReason {
        self.close_rx
            .borrow()
            .clone()
            .unwrap_or(DisconnectReason::ServerRequested)
    }

    async fn teardown(
        self,
        reason: DisconnectReason,
        registry: Arc<ConnectionRegistry>,
        mut writer_task: JoinHandle<()>,
        stop_tx: watch::Sender<bool>,
    ) {
        let SessionDriver {
            handle,
            reader,
            listener,
            settings,
            ..
        } = self;
        let id = handle.id();
        handle.advance(SessionState::Disconnecting);

        if reason.is_server_initiated() {
            let notice = Message::Disconnect(DisconnectNotice {
                reason: reason.to_string(),
            });
            if handle.outbound().try_send(notice).is_err() {
                debug!("Could not queue disconnect notice");
            }
        }

        // The writer drains whatever is queued before it sees the stop signal
        let _ = stop_tx.send(true);
        if timeout(settings.write_timeout, &mut writer_task).await.is_err() {
            warn!("Writer did not finish within {:?}, aborting", settings.write_timeout);
            writer_task.abort();
        }
        drop(reader);

        // Whoever removes the session from the registry reports it
        if registry.remove(&id).is_some() {
            listener.on_client_disconnected(&handle.info(), &reason);
        } else {
            debug!("Session already reported as disconnected");
        }
        handle.advance(SessionState::Closed);

        match &reason {
            DisconnectReason::HandshakeFailure(_) | DisconnectReason::Protocol(_) => {
                warn!("Session closed: {}", reason)
            }
            _ => info!("Session closed: {}", reason),
        }
    }
}

/// Single writer for the socket; exits on stop signal or write failure.
///
/// A frame that cannot be written within `write_timeout` closes the
/// session, so a peer that stops reading cannot stall senders forever.
async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut outbound: mpsc::Receiver<Message>,
    mut stop_rx: watch::Receiver<bool>,
    handle: Arc<SessionHandle>,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let failure = match timeout(write_timeout, writer.write_message(&message)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("write timed out after {:?}", write_timeout),
                };
                warn!("Failed to write {} frame: {}", message.kind_name(), failure);
                handle.close(DisconnectReason::Io(failure));
                return;
            }
            _ = stop_rx.changed() => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
}
