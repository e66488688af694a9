//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Loads and validates configuration
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file.
    ///
    /// A missing file is not an error: environment overrides on top of the
    /// defaults are used instead.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using environment and defaults",
                path.display()
            );
            Self::load_from_env()
        }
    }

    /// Load configuration from environment variables over the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Apply `MACROPAD_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_address) = lookup("MACROPAD_BIND_ADDRESS") {
            self.server.bind_address = bind_address;
        }

        if let Some(port) = lookup("MACROPAD_PORT") {
            self.server.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid MACROPAD_PORT: {}", port))?;
        }

        if let Some(timeout) = lookup("MACROPAD_KEEPALIVE_TIMEOUT") {
            self.server.keepalive_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid MACROPAD_KEEPALIVE_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = lookup("MACROPAD_HANDSHAKE_TIMEOUT") {
            self.server.handshake_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid MACROPAD_HANDSHAKE_TIMEOUT: {}", timeout))?;
        }

        if let Some(level) = lookup("MACROPAD_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_management_config()
            .with_context(|| "Management configuration validation failed")?;

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;

        if server.server_name.trim().is_empty() {
            bail!("server_name must not be empty");
        }

        if server.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        if server.keepalive_timeout < Duration::from_secs(1) {
            bail!("keepalive_timeout must be at least 1s");
        }

        if server.keepalive_timeout > Duration::from_secs(3600) {
            bail!("keepalive_timeout cannot exceed 1 hour");
        }

        if server.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        if server.max_frame_length < 1024 {
            bail!("max_frame_length must be at least 1024 bytes");
        }

        if server.max_frame_length > 16 * 1024 * 1024 {
            bail!("max_frame_length cannot exceed 16MB");
        }

        if server.outbound_queue_capacity == 0 {
            bail!("outbound_queue_capacity must be greater than 0");
        }

        Ok(())
    }

    fn validate_management_config(&self) -> Result<()> {
        let auth = &self.management.auth;
        if !self.management.enabled || !auth.enabled {
            return Ok(());
        }

        if auth.api_key.as_deref().map_or(true, str::is_empty) && auth.basic_auth.is_none() {
            bail!("management.auth is enabled but neither api_key nor basic_auth is set");
        }

        if let Some(basic) = &auth.basic_auth {
            if basic.username.is_empty() || basic.password.is_empty() {
                bail!("management.auth.basic_auth needs a username and a password");
            }
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        log_level: Option<&str>,
        no_management: bool,
    ) {
        if let Some(bind) = bind {
            self.server.bind_address = bind.trim().to_string();
            tracing::info!("CLI override: bind address set to '{}'", bind.trim());
        }

        if let Some(port) = port {
            self.server.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }

        if no_management {
            self.management.enabled = false;
            tracing::info!("CLI override: management API disabled");
        }
    }
}
