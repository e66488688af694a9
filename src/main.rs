//! macropad-server
//!
//! Accepts macro-pad clients over TCP and reports their actions.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use macropad_server::{
    config::ConfigManager,
    connection::{Acceptor, ConnectionRegistry},
    events::{ChannelListener, ServerEvent},
    management::ManagementServer,
    metrics::Metrics,
    shutdown::ShutdownAwareTask,
    ShutdownCoordinator,
};

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "macropad-server")]
#[command(about = "Connection server for macro-pad clients")]
#[command(version)]
#[command(long_about = "
Connection server for macro-pad clients.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  MACROPAD_BIND_ADDRESS       - Bind address, empty for all interfaces
  MACROPAD_PORT               - Listening port (0 for an ephemeral port)
  MACROPAD_KEEPALIVE_TIMEOUT  - Idle time before a client is dropped (e.g. 60s)
  MACROPAD_HANDSHAKE_TIMEOUT  - Time allowed for the handshake (e.g. 10s)
  MACROPAD_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    #[arg(short, long, default_value = "macropad.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    #[arg(short, long, help = "Bind address (e.g. 0.0.0.0 or a host name)")]
    pub bind: Option<String>,

    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    #[arg(long, help = "Log level (trace, debug, info, warn, error)")]
    pub log_level: Option<String>,

    /// Sets the log level to debug
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[arg(long, help = "Do not start the management API")]
    pub no_management: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load_from_file(&args.config)?;
    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.log_level.as_deref(),
        args.no_management,
    );

    let log_level = if args.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_tracing(log_level)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!(
            "  Endpoint: '{}':{}",
            config.server.bind_address, config.server.port
        );
        info!("  Handshake timeout: {:?}", config.server.handshake_timeout);
        info!("  Keep-alive timeout: {:?}", config.server.keepalive_timeout);
        info!(
            "  Management API: {}",
            if config.management.enabled {
                config.management.bind_addr.to_string()
            } else {
                "disabled".to_string()
            }
        );
        return Ok(());
    }

    info!("Starting macropad-server v{}", env!("CARGO_PKG_VERSION"));

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);

    let listener = Arc::new(
        ChannelListener::default()
            .with_normal_action_handler(|action| {
                info!(
                    "Action '{}' from '{}' (profile '{}')",
                    action.action_id, action.client_name, action.profile_id
                );
                true
            })
            .with_toggle_action_handler(|action, state| {
                info!(
                    "Toggle '{}' from '{}' set to {}",
                    action.action_id, action.client_name, state
                );
                true
            }),
    );
    let events = listener.subscribe();
    let event_task = ShutdownAwareTask::spawn(&shutdown_coordinator, "event-log", {
        let metrics = Arc::clone(&metrics);
        move |_shutdown| log_events(events, metrics)
    });

    let registry = Arc::new(ConnectionRegistry::new());
    let acceptor = Arc::new(Acceptor::from_config(&config.server, registry, listener));

    let management_handle = if config.management.enabled {
        let management_server = ManagementServer::new(
            config.management.bind_addr,
            Arc::clone(&acceptor),
            Arc::clone(&metrics),
            config.management.auth.clone(),
        );

        Some(tokio::spawn(async move {
            if let Err(e) = management_server.start().await {
                error!("Management API server error: {}", e);
            }
        }))
    } else {
        info!("Management API server disabled");
        None
    };

    // A bind failure is already reported; the listener can be restarted
    // through the management API.
    if let Err(e) = acceptor.start().await {
        if management_handle.is_none() {
            return Err(e).context("Failed to start listener");
        }
        warn!("Listener not started: {}", e);
    }

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down");
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.shutdown_acceptor(&acceptor).await;

    if let Some(handle) = management_handle {
        handle.abort();
        // Cancelled is the expected outcome
        let _ = handle.await;
        info!("Management API server shutdown");
    }

    // The event channel closes with the last listener reference, after the
    // event task has logged the disconnects published during shutdown
    drop(acceptor);
    if let Err(e) = event_task.wait_for_completion(EVENT_DRAIN_TIMEOUT).await {
        warn!("Event task: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Log every server event and feed it to the metrics collector
async fn log_events(
    mut events: tokio::sync::broadcast::Receiver<ServerEvent>,
    metrics: Arc<Metrics>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event log fell behind, {} events skipped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        metrics.observe(&event);

        match &event {
            ServerEvent::Listening { description, .. } => info!("{}", description),
            ServerEvent::BindFailure {
                address,
                port,
                cause,
            } => error!("Could not listen on {}:{}: {}", address, port, cause),
            ServerEvent::FatalAcceptorError { cause } => {
                error!("Listener stopped unexpectedly: {}", cause)
            }
            ServerEvent::ClientConnected { session } => info!(
                "Client '{}' connected from {} as {}",
                session.client_name().unwrap_or("?"),
                session.remote_addr,
                session.id
            ),
            ServerEvent::ClientDisconnected { session, reason } => info!(
                "Client {} ({}) disconnected: {}",
                session.id, session.remote_addr, reason
            ),
            ServerEvent::NormalActionTriggered { .. } | ServerEvent::ToggleActionTriggered { .. } => {}
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}
