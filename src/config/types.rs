//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub management: ManagementConfig,
    pub logging: LoggingConfig,
}

/// Macro-pad listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Empty means all interfaces
    pub bind_address: String,
    pub port: u16,
    pub server_name: String,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub max_frame_length: usize,
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            port: 6740,
            server_name: "macropad-server".to_string(),
            handshake_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            outbound_queue_capacity: 64,
        }
    }
}

/// Management API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    pub auth: ApiAuthConfig,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9180)),
            auth: ApiAuthConfig::default(),
        }
    }
}

/// API authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiAuthConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub basic_auth: Option<BasicAuthConfig>,
}

/// Basic authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

impl Default for ApiAuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: Some("change-me".to_string()),
            basic_auth: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
