//! Management API Handlers

use super::types::*;
use crate::connection::{Acceptor, AcceptorState, SessionHandle, SessionInfo};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::protocol::{ActionGrid, ToggleState};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub acceptor: Arc<Acceptor>,
    pub metrics: Arc<Metrics>,
    pub start_time: SystemTime,
}

/// Error response with a status code and an `ApiResponse` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("No client with id {}", id),
        }
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        let status = match &err {
            ServerError::InvalidEndpoint { .. } => StatusCode::BAD_REQUEST,
            ServerError::AlreadyRunning => StatusCode::CONFLICT,
            ServerError::BindFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::SessionClosed(_) => StatusCode::GONE,
            ServerError::DuplicateIdentity(_) | ServerError::UnexpectedAcceptor(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn lookup(state: &AppState, id: &str) -> Result<Arc<SessionHandle>, ApiError> {
    state
        .acceptor
        .find_session(id)
        .ok_or_else(|| ApiError::not_found(id))
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let acceptor = state.acceptor.state();
    let status = match acceptor {
        AcceptorState::Listening => "healthy",
        AcceptorState::Starting | AcceptorState::Stopped => "degraded",
    };

    Json(ApiResponse::success(HealthStatus {
        status: status.to_string(),
        acceptor,
        timestamp: SystemTime::now(),
    }))
}

fn server_status(state: &AppState) -> ServerStatus {
    let uptime = SystemTime::now()
        .duration_since(state.start_time)
        .unwrap_or_default()
        .as_secs();

    ServerStatus {
        state: state.acceptor.state(),
        endpoint: state.acceptor.endpoint(),
        local_addr: state.acceptor.local_addr(),
        connected_clients: state.acceptor.registry().len(),
        sessions_connected_total: state.metrics.connected_total(),
        uptime_seconds: uptime,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Get server status
pub async fn get_server_status(State(state): State<AppState>) -> Json<ApiResponse<ServerStatus>> {
    Json(ApiResponse::success(server_status(&state)))
}

/// Start listening on the configured endpoint
pub async fn start_server(State(state): State<AppState>) -> ApiResult<StartResponse> {
    let local_addr = state.acceptor.start().await?;
    info!("Listener started through management API on {}", local_addr);
    Ok(Json(ApiResponse::success(StartResponse { local_addr })))
}

/// Stop listening and disconnect every client
pub async fn stop_server(State(state): State<AppState>) -> Json<ApiResponse<ServerStatus>> {
    state.acceptor.stop().await;
    info!("Listener stopped through management API");
    Json(ApiResponse::success(server_status(&state)))
}

/// Change the endpoint used by the next start
pub async fn update_endpoint(
    State(state): State<AppState>,
    Json(request): Json<EndpointRequest>,
) -> ApiResult<ServerStatus> {
    state
        .acceptor
        .configure(&request.bind_address, request.port)?;
    Ok(Json(ApiResponse::success(server_status(&state))))
}

/// List connected clients
pub async fn list_clients(State(state): State<AppState>) -> Json<ApiResponse<Vec<SessionInfo>>> {
    Json(ApiResponse::success(state.acceptor.sessions()))
}

/// Get one client
pub async fn get_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionInfo> {
    let session = lookup(&state, &id)?;
    Ok(Json(ApiResponse::success(session.info())))
}

/// Disconnect one client
pub async fn disconnect_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionInfo> {
    let session = lookup(&state, &id)?;
    if !state.acceptor.disconnect(&session.id()) {
        return Err(ApiError::not_found(&id));
    }
    info!("Client {} disconnected through management API", id);
    Ok(Json(ApiResponse::success(session.info())))
}

/// Push an action grid to one client
pub async fn push_grid(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(grid): Json<ActionGrid>,
) -> ApiResult<SessionInfo> {
    let session = lookup(&state, &id)?;
    session.push_grid(grid).await?;
    Ok(Json(ApiResponse::success(session.info())))
}

/// Push a toggle state change to one client
pub async fn push_toggle_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(toggle): Json<ToggleState>,
) -> ApiResult<SessionInfo> {
    let session = lookup(&state, &id)?;
    session.push_toggle_state(toggle).await?;
    Ok(Json(ApiResponse::success(session.info())))
}

/// Prometheus text exposition
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}
