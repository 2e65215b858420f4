use thiserror::Error;

use crate::client::token_storage::StoreError;

/// Failures surfaced by the authentication core.
///
/// Every payload is owned text so the error can be cloned and handed to each
/// caller sharing a single in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Server error (HTTP {0})")]
    ServerError(u16),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected response (HTTP {0})")]
    UnexpectedStatus(u16),

    #[error("Request rejected as unauthorized")]
    Unauthorized,

    #[error("Refresh token expired")]
    RefreshExpired,

    #[error("Failed to refresh token: {0}")]
    RefreshFailed(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    /// Human readable text for the login screen. Server supplied detail wins
    /// over generic wording.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Invalid email or password".to_string(),
            AuthError::BadRequest(msg) if !msg.is_empty() => msg.clone(),
            AuthError::BadRequest(_) => "Invalid request".to_string(),
            AuthError::ServerError(_) => "Server error. Please try again later.".to_string(),
            AuthError::NetworkError(_) => {
                "Network error. Please check your connection.".to_string()
            }
            AuthError::ProtocolError(detail) => format!("Login response error: {}", detail),
            AuthError::RefreshExpired | AuthError::NotAuthenticated | AuthError::Unauthorized => {
                "Your session has ended. Please sign in again.".to_string()
            }
            other => format!("Login failed: {}", other),
        }
    }

    /// Whether the failure happened before any response reached us.
    pub fn is_network(&self) -> bool {
        matches!(self, AuthError::NetworkError(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::ProtocolError(err.to_string())
        } else if err.is_builder() {
            AuthError::Configuration(err.to_string())
        } else {
            AuthError::NetworkError(err.to_string())
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Storage(err.to_string())
    }
}
