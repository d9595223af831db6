//! Kite Ticker Authentication
//!
//! Kite authenticates the ticker at the WebSocket upgrade: the API key and
//! access token travel in the query string and a bad pair is refused with
//! HTTP 403 before any frame is exchanged. There is no explicit auth ack, so
//! the first frame that is not an error counts as one.
//!
//! # Authentication Flow
//!
//! 1. Fetch the access token from the `AccessTokenProvider`
//! 2. Connect to `wss://ws.kite.trade?api_key=..&access_token=..`
//! 3. Upgrade refused (401/403) → `AuthError::Rejected`
//! 4. First frame within `auth_timeout`:
//!    - `{"type":"error",...}` → `AuthError::Rejected`
//!    - close → `AuthError::ClosedDuringHandshake`
//!    - anything else → authenticated
//! 5. Nothing within `auth_timeout` → `AuthError::Timeout`

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::application::ports::{AccessTokenProvider, TransportError};
use crate::infrastructure::config::Credentials;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Credentials refused by the server.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// No frame arrived within the auth timeout.
    #[error("authentication timeout after {0:?}")]
    Timeout(Duration),

    /// Server closed the connection before acknowledging.
    #[error("connection closed during authentication")]
    ClosedDuringHandshake,

    /// Access token could not be obtained.
    #[error("access token unavailable: {0}")]
    TokenUnavailable(String),
}

// =============================================================================
// Token Provider
// =============================================================================

/// Access token fixed at startup (issued out of band by the login flow).
#[derive(Debug, Clone)]
pub struct StaticAccessToken {
    credentials: Credentials,
}

impl StaticAccessToken {
    /// Create a provider serving the configured credentials.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticAccessToken {
    fn api_key(&self) -> &str {
        self.credentials.api_key()
    }

    async fn access_token(&self) -> Result<String, TransportError> {
        let token = self.credentials.access_token();
        if token.is_empty() {
            return Err(TransportError::Unauthorized(
                "no access token configured".to_string(),
            ));
        }
        Ok(token.to_string())
    }
}

/// Ticker URL with credentials in the query string.
#[must_use]
pub fn authorized_url(base: &str, api_key: &str, access_token: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}api_key={api_key}&access_token={access_token}")
}

/// Redact the access token of an authorized URL for logging.
#[must_use]
pub fn redact_url(url: &str) -> String {
    match url.find("access_token=") {
        Some(pos) => {
            let value_start = pos + "access_token=".len();
            let value_end = url[value_start..]
                .find('&')
                .map_or(url.len(), |i| value_start + i);
            format!("{}[REDACTED]{}", &url[..value_start], &url[value_end..])
        }
        None => url.to_string(),
    }
}
