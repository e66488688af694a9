//! Graceful Shutdown Handling
//!
//! Turns SIGTERM/SIGINT into a broadcast shutdown signal and stops the
//! acceptor, which closes every client session.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::Acceptor;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Expected upper bound for stopping the acceptor
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no subscribers");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl-C, then broadcast the shutdown signal
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }

        Ok(())
    }

    /// Stop the acceptor and wait for its sessions to close.
    ///
    /// `Acceptor::stop` bounds its own wait on sessions, so this never hangs.
    pub async fn shutdown_acceptor(&self, acceptor: &Acceptor) {
        info!(
            "Stopping listener with {} connected clients",
            acceptor.registry().len()
        );
        let start_time = Instant::now();

        acceptor.stop().await;

        let elapsed = start_time.elapsed();
        if elapsed > self.timeout {
            warn!("Listener took {:?} to stop (timeout: {:?})", elapsed, self.timeout);
        } else {
            info!("Listener stopped in {:?}", elapsed);
        }
    }
}

/// Background task handed a shutdown receiver when spawned
pub struct ShutdownAwareTask {
    name: String,
    handle: tokio::task::JoinHandle<()>,
}

impl ShutdownAwareTask {
    pub fn spawn<F, Fut>(
        shutdown_coordinator: &ShutdownCoordinator,
        task_name: &str,
        task_fn: F,
    ) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let shutdown_rx = shutdown_coordinator.subscribe();
        let name = task_name.to_string();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!("Starting shutdown-aware task: {}", task_name);
            task_fn(shutdown_rx).await;
            debug!("Shutdown-aware task completed: {}", task_name);
        });

        Self { name, handle }
    }

    /// Wait up to `limit` for the task to finish on its own, then abort it
    pub async fn wait_for_completion(mut self, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(Ok(())) => {
                debug!("Task {} completed", self.name);
                Ok(())
            }
            Ok(Err(e)) if e.is_cancelled() => {
                debug!("Task {} was cancelled", self.name);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Task {} failed: {}", self.name, e);
                Err(anyhow::anyhow!("Task {} failed: {}", self.name, e))
            }
            Err(_) => {
                self.handle.abort();
                Err(anyhow::anyhow!(
                    "Task {} still running after {:?}, aborted",
                    self.name,
                    limit
                ))
            }
        }
    }
}
