//! Error types for OAuth and storage operations.

use thiserror::Error;

/// Errors that can occur during OAuth and storage operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the storage backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize persisted data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request to an OAuth endpoint failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),

    /// No PKCE code verifier is stored for the server.
    ///
    /// This signals a corrupted or expired authorization flow; callers must
    /// start a fresh flow rather than substituting a default.
    #[error("No code verifier stored for {0} - the authorization flow is corrupted or expired")]
    MissingCodeVerifier(String),

    /// Callback carried a state parameter with no matching record.
    #[error("Unknown or missing OAuth state parameter - possible CSRF attempt")]
    StateNotFound,

    /// Callback state record belongs to a different server.
    #[error("OAuth state parameter belongs to a different server")]
    StateMismatch,

    /// Callback state record is past its expiry window.
    #[error("OAuth state record expired - restart the authorization flow")]
    StateExpired,

    /// OAuth metadata discovery failed or the server advertised no usable endpoints.
    #[error("OAuth metadata discovery failed: {0}")]
    Discovery(String),

    /// Dynamic client registration failed.
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// Authorization code or refresh token exchange failed.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The authorization server returned an error response.
    #[error("Authorization denied: {0}")]
    Denied(String),

    /// The user did not complete authorization within the allowed window.
    #[error("Authorization timed out after {0} seconds")]
    Timeout(u64),

    /// The authorization flow was cancelled before completion.
    #[error("Authorization cancelled")]
    Cancelled,

    /// Failed to spawn a browser for the authorization URL.
    ///
    /// Callers treat this as non-fatal and fall back to the persisted
    /// authorization URL for manual navigation.
    #[error("Failed to open browser: {0}")]
    Browser(String),

    /// The loopback callback server could not start or serve.
    #[error("Callback server error: {0}")]
    Callback(String),
}

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;
