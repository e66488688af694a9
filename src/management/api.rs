//! Management API Routes

use super::{
    auth::{auth_middleware, ApiAuth},
    handlers::*,
};
use crate::config::ApiAuthConfig;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Management API router
pub struct ManagementApi;

impl ManagementApi {
    /// Create the management API router
    pub fn create_router(state: AppState, auth_config: ApiAuthConfig) -> Router {
        let auth = Arc::new(ApiAuth::new(auth_config));

        // Public routes (no authentication required)
        let public_routes = Router::new()
            .route("/health", get(health_check))
            .with_state(state.clone());

        let protected_routes = Router::new()
            // Listener control
            .route("/status", get(get_server_status))
            .route("/server/start", post(start_server))
            .route("/server/stop", post(stop_server))
            .route("/server/endpoint", put(update_endpoint))
            // Clients
            .route("/clients", get(list_clients))
            .route("/clients/:id", get(get_client).delete(disconnect_client))
            .route("/clients/:id/grid", post(push_grid))
            .route("/clients/:id/toggle", post(push_toggle_state))
            .route("/metrics", get(get_metrics))
            .layer(middleware::from_fn_with_state(auth, auth_middleware))
            .with_state(state);

        Router::new()
            .nest("/api/v1", public_routes.merge(protected_routes))
            .layer(CorsLayer::permissive())
    }
}
