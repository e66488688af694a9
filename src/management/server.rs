//! Management API Server

use super::{api::ManagementApi, handlers::AppState};
use crate::config::ApiAuthConfig;
use crate::{connection::Acceptor, metrics::Metrics, Result};
use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Management API server
pub struct ManagementServer {
    bind_addr: SocketAddr,
    app_state: AppState,
    auth_config: ApiAuthConfig,
}

impl ManagementServer {
    pub fn new(
        bind_addr: SocketAddr,
        acceptor: Arc<Acceptor>,
        metrics: Arc<Metrics>,
        auth_config: ApiAuthConfig,
    ) -> Self {
        let app_state = AppState {
            acceptor,
            metrics,
            start_time: SystemTime::now(),
        };

        Self {
            bind_addr,
            app_state,
            auth_config,
        }
    }

    pub fn router(&self) -> Router {
        ManagementApi::create_router(self.app_state.clone(), self.auth_config.clone())
    }

    /// Serve until the task is aborted or the socket fails
    pub async fn start(self) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(self.bind_addr).await.with_context(|| {
            format!("Failed to bind management API server to {}", self.bind_addr)
        })?;

        info!("Management API server listening on {}", self.bind_addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("Management API server error: {}", e);
            return Err(e.into());
        }

        Ok(())
    }
}
