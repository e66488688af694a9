//! Metrics Collector

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::SystemTime;
use tracing::error;

use crate::events::ServerEvent;

/// Prometheus metrics derived from the server event stream
pub struct Metrics {
    registry: Registry,
    sessions_connected_total: IntCounter,
    sessions_active: IntGauge,
    sessions_disconnected_total: IntCounterVec,
    session_duration: Histogram,
    actions_total: IntCounterVec,
    bind_failures_total: IntCounter,
    acceptor_fatal_errors_total: IntCounter,
}

impl Metrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sessions_connected_total = IntCounter::new(
            "macropad_sessions_connected_total",
            "Clients that completed the handshake",
        )?;
        let sessions_active = IntGauge::new(
            "macropad_sessions_active",
            "Clients currently connected",
        )?;
        let sessions_disconnected_total = IntCounterVec::new(
            Opts::new(
                "macropad_sessions_disconnected_total",
                "Sessions closed, by reason",
            ),
            &["reason"],
        )?;
        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "macropad_session_duration_seconds",
                "Lifetime of client sessions in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]),
        )?;
        let actions_total = IntCounterVec::new(
            Opts::new("macropad_actions_total", "Actions triggered by clients"),
            &["kind", "outcome"],
        )?;
        let bind_failures_total = IntCounter::new(
            "macropad_bind_failures_total",
            "Failed attempts to bind the listening endpoint",
        )?;
        let acceptor_fatal_errors_total = IntCounter::new(
            "macropad_acceptor_fatal_errors_total",
            "Accept loops stopped by an unexpected error",
        )?;

        registry.register(Box::new(sessions_connected_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_disconnected_total.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;
        registry.register(Box::new(actions_total.clone()))?;
        registry.register(Box::new(bind_failures_total.clone()))?;
        registry.register(Box::new(acceptor_fatal_errors_total.clone()))?;

        Ok(Self {
            registry,
            sessions_connected_total,
            sessions_active,
            sessions_disconnected_total,
            session_duration,
            actions_total,
            bind_failures_total,
            acceptor_fatal_errors_total,
        })
    }

    /// Update counters for one event
    pub fn observe(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Listening { .. } => {}
            ServerEvent::BindFailure { .. } => self.bind_failures_total.inc(),
            ServerEvent::FatalAcceptorError { .. } => self.acceptor_fatal_errors_total.inc(),
            ServerEvent::ClientConnected { .. } => {
                self.sessions_connected_total.inc();
                self.sessions_active.inc();
            }
            ServerEvent::ClientDisconnected { session, reason } => {
                // Only sessions reported as connected were counted as active
                if session.connected {
                    self.sessions_active.dec();
                }
                self.sessions_disconnected_total
                    .with_label_values(&[reason.label()])
                    .inc();
                if let Ok(lifetime) = SystemTime::now().duration_since(session.accepted_at) {
                    self.session_duration.observe(lifetime.as_secs_f64());
                }
            }
            ServerEvent::NormalActionTriggered { success, .. } => {
                self.actions_total
                    .with_label_values(&["normal", outcome(*success)])
                    .inc();
            }
            ServerEvent::ToggleActionTriggered { success, .. } => {
                self.actions_total
                    .with_label_values(&["toggle", outcome(*success)])
                    .inc();
            }
        }
    }

    pub fn active_sessions(&self) -> i64 {
        self.sessions_active.get()
    }

    pub fn connected_total(&self) -> u64 {
        self.sessions_connected_total.get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, DisconnectReason, SessionInfo, SessionState};
    use crate::events::TriggeredAction;
    use crate::protocol::ClientHello;

    fn session(handshaken: bool) -> SessionInfo {
        let addr = "127.0.0.1:50000".parse().unwrap();
        SessionInfo {
            id: ConnectionId::new(1, addr),
            remote_addr: addr,
            state: SessionState::Disconnecting,
            client: handshaken.then(|| ClientHello {
                client_name: "tablet".to_string(),
                client_version: "1.0".to_string(),
                platform: String::new(),
                profiles: vec![],
                screen: None,
            }),
            connected: handshaken,
            accepted_at: SystemTime::now(),
            idle_ms: 0,
        }
    }

    #[test]
    fn test_session_gauge_follows_events() {
        let metrics = Metrics::new().unwrap();
        metrics.observe(&ServerEvent::ClientConnected {
            session: session(true),
        });
        assert_eq!(metrics.active_sessions(), 1);

        metrics.observe(&ServerEvent::ClientDisconnected {
            session: session(false),
            reason: DisconnectReason::HandshakeFailure("bad".to_string()),
        });
        assert_eq!(metrics.active_sessions(), 1);

        metrics.observe(&ServerEvent::ClientDisconnected {
            session: session(true),
            reason: DisconnectReason::PeerClosed,
        });
        assert_eq!(metrics.active_sessions(), 0);
        assert_eq!(metrics.connected_total(), 1);
    }

    #[test]
    fn test_disconnect_before_connected_event_leaves_gauge_alone() {
        let metrics = Metrics::new().unwrap();

        // Hello was read but the session closed before it was announced
        let mut closed_early = session(true);
        closed_early.connected = false;
        metrics.observe(&ServerEvent::ClientDisconnected {
            session: closed_early,
            reason: DisconnectReason::ServerShutdown,
        });

        assert_eq!(metrics.active_sessions(), 0);
        assert_eq!(metrics.connected_total(), 0);
    }

    #[test]
    fn test_export_contains_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.observe(&ServerEvent::NormalActionTriggered {
            action: TriggeredAction {
                connection_id: ConnectionId::new(1, "127.0.0.1:1".parse().unwrap()),
                client_name: "tablet".to_string(),
                profile_id: "p".to_string(),
                action_id: "a".to_string(),
            },
            success: false,
        });

        let text = metrics.export_prometheus();
        assert!(text.contains("macropad_actions_total{kind=\"normal\",outcome=\"failure\"} 1"));
        assert!(text.contains("macropad_sessions_active 0"));
    }
}
