//! Management API Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::connection::{AcceptorState, ListeningEndpoint};

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: SystemTime,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: SystemTime::now(),
        }
    }
}

/// Server status information
#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub state: AcceptorState,
    pub endpoint: ListeningEndpoint,
    pub local_addr: Option<SocketAddr>,
    pub connected_clients: usize,
    pub sessions_connected_total: u64,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub acceptor: AcceptorState,
    pub timestamp: SystemTime,
}

/// Endpoint change request. `port` is wider than u16 so out-of-range
/// values reach the acceptor's own validation.
#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    #[serde(default)]
    pub bind_address: String,
    pub port: u32,
}

/// Result of starting the listener
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub local_addr: SocketAddr,
}
