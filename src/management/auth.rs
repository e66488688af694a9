//! Management API Authentication

use crate::config::ApiAuthConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;
use tracing::{debug, warn};

/// API authentication middleware
pub struct ApiAuth {
    config: ApiAuthConfig,
}

impl ApiAuth {
    pub fn new(config: ApiAuthConfig) -> Self {
        Self { config }
    }

    /// Validate API key authentication
    fn validate_api_key(&self, headers: &HeaderMap) -> bool {
        let Some(expected_key) = self.config.api_key.as_deref() else {
            return false;
        };
        headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map_or(false, |provided| provided == expected_key)
    }

    /// Validate basic authentication
    fn validate_basic_auth(&self, headers: &HeaderMap) -> bool {
        let Some(basic_config) = &self.config.basic_auth else {
            return false;
        };
        let credentials = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| general_purpose::STANDARD.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok());

        match credentials.as_deref().and_then(|c| c.split_once(':')) {
            Some((username, password)) => {
                username == basic_config.username && password == basic_config.password
            }
            None => false,
        }
    }

    /// Authenticate request
    pub fn authenticate(&self, headers: &HeaderMap) -> bool {
        if !self.config.enabled {
            debug!("API authentication disabled, allowing request");
            return true;
        }

        if self.validate_api_key(headers) {
            debug!("API key authentication successful");
            return true;
        }

        if self.validate_basic_auth(headers) {
            debug!("Basic authentication successful");
            return true;
        }

        warn!("API authentication failed");
        false
    }
}

/// Authentication middleware function
pub async fn auth_middleware(
    State(auth): State<Arc<ApiAuth>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if auth.authenticate(request.headers()) {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
