//! Acceptor
//!
//! Owns the listening socket and the accept loop. Each accepted socket gets
//! a fresh identity, is registered, and is driven by its own session task.
//! Stopping the acceptor cancels the loop first and then closes every
//! session it created.

use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::registry::ConnectionRegistry;
use super::session::{ConnectionSession, SessionHandle, SessionSettings};
use super::types::{AcceptorState, ConnectionId, DisconnectReason, ListeningEndpoint, SessionInfo};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::events::ServerListener;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How an accept error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The listener was closed on purpose
    Expected,
    /// A single connection went bad before we got it; keep accepting
    Transient,
    Fatal,
}

fn classify_accept_error(err: &io::Error, cancelled: bool) -> AcceptFailure {
    if cancelled {
        return AcceptFailure::Expected;
    }
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptFailure::Transient,
        _ => AcceptFailure::Fatal,
    }
}

/// State shared between the acceptor and its accept-loop task
struct AcceptorInner {
    registry: Arc<ConnectionRegistry>,
    listener: Arc<dyn ServerListener>,
    settings: Arc<SessionSettings>,
    endpoint: Mutex<ListeningEndpoint>,
    state: Mutex<AcceptorState>,
    local_addr: Mutex<Option<SocketAddr>>,
    sessions: Mutex<JoinSet<()>>,
    next_serial: AtomicU64,
}

/// Handle on a running accept loop
struct RunningAcceptor {
    cancelled: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningAcceptor {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

/// TCP acceptor for macro-pad clients
pub struct Acceptor {
    inner: Arc<AcceptorInner>,
    control: tokio::sync::Mutex<Option<RunningAcceptor>>,
    shutdown_timeout: Duration,
}

impl Acceptor {
    pub fn new(registry: Arc<ConnectionRegistry>, listener: Arc<dyn ServerListener>) -> Self {
        Self {
            inner: Arc::new(AcceptorInner {
                registry,
                listener,
                settings: Arc::new(SessionSettings::default()),
                endpoint: Mutex::new(ListeningEndpoint::default()),
                state: Mutex::new(AcceptorState::Stopped),
                local_addr: Mutex::new(None),
                sessions: Mutex::new(JoinSet::new()),
                next_serial: AtomicU64::new(1),
            }),
            control: tokio::sync::Mutex::new(None),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Build an acceptor from the `[server]` config section
    pub fn from_config(
        config: &ServerConfig,
        registry: Arc<ConnectionRegistry>,
        listener: Arc<dyn ServerListener>,
    ) -> Self {
        let acceptor = Self::new(registry, listener)
            .with_session_settings(SessionSettings::from_config(config))
            .with_shutdown_timeout(config.shutdown_timeout);
        *acceptor.inner.endpoint.lock() =
            ListeningEndpoint::new(config.bind_address.clone(), config.port);
        acceptor
    }

    /// Replace the per-session settings.
    ///
    /// Only applies before the first `start`; a running accept loop shares
    /// the settings and keeps the ones it was started with.
    pub fn with_session_settings(mut self, settings: SessionSettings) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.settings = Arc::new(settings),
            None => warn!("Session settings ignored: acceptor is already in use"),
        }
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Set the endpoint used by the next `start`.
    ///
    /// `port` 0 asks the OS for an ephemeral port.
    pub fn configure(&self, bind_address: &str, port: u32) -> Result<(), ServerError> {
        let port = u16::try_from(port).map_err(|_| ServerError::InvalidEndpoint { port })?;
        if *self.inner.state.lock() != AcceptorState::Stopped {
            return Err(ServerError::AlreadyRunning);
        }
        *self.inner.endpoint.lock() = ListeningEndpoint::new(bind_address.trim(), port);
        debug!("Endpoint configured: {}:{}", bind_address.trim(), port);
        Ok(())
    }

    /// Bind the configured endpoint and start accepting.
    ///
    /// Bind failures are reported to the listener and leave the acceptor
    /// stopped. Returns the bound local address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut control = self.control.lock().await;

        {
            let mut state = self.inner.state.lock();
            if *state != AcceptorState::Stopped {
                return Err(ServerError::AlreadyRunning);
            }
            *state = AcceptorState::Starting;
        }

        // A loop that died on a fatal error leaves its handle behind
        if let Some(stale) = control.take() {
            stale.cancel();
            if let Err(e) = stale.task.await {
                debug!("Previous accept loop ended abnormally: {}", e);
            }
        }

        let endpoint = self.inner.endpoint.lock().clone();
        let listener = match bind(&endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                let address = display_address(&endpoint);
                error!("Failed to bind {}:{}: {}", address, endpoint.port, e);
                *self.inner.state.lock() = AcceptorState::Stopped;
                self.inner.listener.on_bind_failure(&address, endpoint.port, &e);
                return Err(ServerError::BindFailure {
                    address,
                    port: endpoint.port,
                    source: e,
                });
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                *self.inner.state.lock() = AcceptorState::Stopped;
                self.inner.listener.on_fatal_acceptor_error(&e);
                return Err(ServerError::UnexpectedAcceptor(e));
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.local_addr.lock() = Some(local_addr);
        *self.inner.state.lock() = AcceptorState::Listening;

        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            Arc::clone(&cancelled),
            shutdown_rx,
        ));
        *control = Some(RunningAcceptor {
            cancelled,
            shutdown_tx,
            task,
        });

        let description = listening_description(&endpoint, local_addr);
        info!("{}", description);
        self.inner.listener.on_listening(&description, local_addr);

        Ok(local_addr)
    }

    /// Stop accepting and close every session. Safe to call when stopped.
    ///
    /// Overlapping calls are serialized; a second caller returns once the
    /// first one has closed every session.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;

        if let Some(running) = control.take() {
            running.cancel();
            if let Err(e) = running.task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
            info!("Acceptor stopped");
        }

        *self.inner.state.lock() = AcceptorState::Stopped;
        *self.inner.local_addr.lock() = None;

        self.close_sessions().await;
        drop(control);
    }

    async fn close_sessions(&self) {
        let asked = self.inner.registry.close_all(DisconnectReason::ServerShutdown);
        let mut sessions = std::mem::take(&mut *self.inner.sessions.lock());
        if asked == 0 && sessions.is_empty() {
            return;
        }
        debug!("Closing {} sessions", asked);

        let drained = timeout(self.shutdown_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} sessions still open after {:?}, aborting",
                sessions.len(),
                self.shutdown_timeout
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        // Aborted sessions never ran their teardown
        for session in self.inner.registry.list() {
            if self.inner.registry.remove(&session.id()).is_some() {
                self.inner
                    .listener
                    .on_client_disconnected(&session.info(), &DisconnectReason::ServerShutdown);
            }
        }
    }

    pub fn state(&self) -> AcceptorState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AcceptorState::Listening
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn session_settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn endpoint(&self) -> ListeningEndpoint {
        self.inner.endpoint.lock().clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.snapshot()
    }

    /// Look a session up by its display id
    pub fn find_session(&self, display_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.registry.find(display_id)
    }

    /// Ask one session to close. Returns false if it is not registered.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        match self.inner.registry.get(id) {
            Some(session) => {
                session.close(DisconnectReason::ServerRequested);
                true
            }
            None => false,
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Ok(control) = self.control.try_lock() {
            if let Some(running) = control.as_ref() {
                running.cancel();
            }
        }
    }
}

fn display_address(endpoint: &ListeningEndpoint) -> String {
    if endpoint.is_all_interfaces() {
        Ipv4Addr::UNSPECIFIED.to_string()
    } else {
        endpoint.bind_address.trim().to_string()
    }
}

/// Text shown to the operator once bound. A blank bind address lists every
/// IPv4 interface address, since that is what gets typed into the device.
fn listening_description(endpoint: &ListeningEndpoint, local_addr: SocketAddr) -> String {
    if endpoint.is_all_interfaces() {
        match interface_ipv4_addrs() {
            Ok(addrs) if !addrs.is_empty() => {
                return describe_interfaces(&addrs, local_addr.port());
            }
            Ok(_) => debug!("No IPv4 interface addresses found"),
            Err(e) => warn!("Could not list network interfaces: {}", e),
        }
    }
    format!("Listening for macro-pad clients on {}", local_addr)
}

fn describe_interfaces(addrs: &[Ipv4Addr], port: u16) -> String {
    let ips = addrs
        .iter()
        .map(Ipv4Addr::to_string)
        .collect::<Vec<_>>()
        .join(" / ");
    format!("Listening for macro-pad clients on {} (port {})", ips, port)
}

fn interface_ipv4_addrs() -> io::Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<Ipv4Addr> = if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

async fn bind(endpoint: &ListeningEndpoint) -> io::Result<TcpListener> {
    if endpoint.is_all_interfaces() {
        return TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, endpoint.port))).await;
    }

    let mut last_err = None;
    for addr in lookup_host((endpoint.bind_address.trim(), endpoint.port)).await? {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", endpoint.bind_address),
        )
    }))
}

async fn accept_loop(
    inner: Arc<AcceptorInner>,
    listener: TcpListener,
    cancelled: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!("Accept loop received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if cancelled.load(Ordering::SeqCst) {
                        debug!("Dropping connection from {} accepted during shutdown", peer);
                        break;
                    }
                    spawn_session(&inner, stream, peer);
                }
                Err(e) => match classify_accept_error(&e, cancelled.load(Ordering::SeqCst)) {
                    AcceptFailure::Expected => break,
                    AcceptFailure::Transient => {
                        debug!("Transient accept error: {}", e);
                    }
                    AcceptFailure::Fatal => {
                        error!("Acceptor failed: {}", e);
                        *inner.state.lock() = AcceptorState::Stopped;
                        *inner.local_addr.lock() = None;
                        inner.listener.on_fatal_acceptor_error(&e);
                        break;
                    }
                },
            },
        }
    }
    // The listening socket closes when `listener` drops here
}

fn spawn_session(inner: &Arc<AcceptorInner>, stream: TcpStream, peer: SocketAddr) {
    let serial = inner.next_serial.fetch_add(1, Ordering::Relaxed);
    let id = ConnectionId::new(serial, peer);

    let session = ConnectionSession::new(
        stream,
        id,
        Arc::clone(&inner.registry),
        Arc::clone(&inner.listener),
        Arc::clone(&inner.settings),
    );
    if let Err(e) = inner.registry.add(session.handle()) {
        warn!("Rejecting connection from {}: {}", peer, e);
        return;
    }
    debug!(connection_id = %id, "Accepted connection from {}", peer);

    let mut sessions = inner.sessions.lock();
    while let Some(finished) = sessions.try_join_next() {
        if let Err(e) = finished {
            warn!("Session task ended abnormally: {}", e);
        }
    }
    sessions.spawn(session.run());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_errors_are_expected() {
        let err = io::Error::new(io::ErrorKind::Other, "socket closed");
        assert_eq!(classify_accept_error(&err, true), AcceptFailure::Expected);
        assert_eq!(classify_accept_error(&err, false), AcceptFailure::Fatal);
    }

    #[test]
    fn test_per_connection_errors_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            let err = io::Error::new(kind, "peer went away");
            assert_eq!(classify_accept_error(&err, false), AcceptFailure::Transient);
        }
    }

    #[test]
    fn test_interface_description_lists_every_address() {
        let addrs = [Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(10, 0, 0, 4)];
        assert_eq!(
            describe_interfaces(&addrs, 6740),
            "Listening for macro-pad clients on 192.168.1.20 / 10.0.0.4 (port 6740)"
        );
    }

    #[test]
    fn test_blank_address_description_names_interfaces() {
        let local_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 6740));

        let blank = listening_description(&ListeningEndpoint::new("", 6740), local_addr);
        assert!(!blank.contains("0.0.0.0"), "{}", blank);
        assert!(blank.contains("127.0.0.1"), "{}", blank);
        assert!(blank.contains("6740"));

        let explicit = listening_description(
            &ListeningEndpoint::new("127.0.0.1", 6740),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 6740)),
        );
        assert_eq!(explicit, "Listening for macro-pad clients on 127.0.0.1:6740");
    }

    #[tokio::test]
    async fn test_session_settings_are_fixed_once_running() {
        let settings = SessionSettings {
            server_name: "studio".to_string(),
            ..SessionSettings::default()
        };
        let acceptor = Acceptor::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(crate::events::ChannelListener::default()),
        )
        .with_session_settings(settings);
        assert_eq!(acceptor.session_settings().server_name, "studio");

        acceptor.configure("127.0.0.1", 0).unwrap();
        acceptor.start().await.unwrap();

        // The accept loop holds the settings now
        let acceptor = acceptor.with_session_settings(SessionSettings::default());
        assert_eq!(acceptor.session_settings().server_name, "studio");

        acceptor.stop().await;
    }

    #[test]
    fn test_blank_address_is_displayed_as_unspecified() {
        assert_eq!(display_address(&ListeningEndpoint::new("", 9000)), "0.0.0.0");
        assert_eq!(
            display_address(&ListeningEndpoint::new(" 127.0.0.1 ", 9000)),
            "127.0.0.1"
        );
    }
}
