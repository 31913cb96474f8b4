//! Error types for the token endpoint client.

use reqwest::StatusCode;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors that can occur while talking to the token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Network/HTTP transport error.
    #[error("Network error: {0}")]
    Network(String),

    /// Token endpoint answered with a non-success status.
    #[error("Token endpoint returned {status}: {body}")]
    Endpoint { status: StatusCode, body: String },

    /// Token endpoint answered 2xx but the body was not a usable token.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}
