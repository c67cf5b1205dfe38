//! Client error types.

use crate::transport::TransportError;
use mcplink_auth::AuthError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Server not found in the registry.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Tool not found on any connected server.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Prompt not found.
    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    /// Operation attempted while not connected.
    #[error("Not connected to {0}")]
    NotConnected(String),

    /// Protocol-level error (malformed or unexpected message).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by the server.
    #[error("Server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Server rejected the initialize handshake.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    Tool(String),

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// OAuth flow failure.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The server requires authentication, custom headers were supplied,
    /// and they were rejected.
    #[error("Authentication failed for {0}: the provided credentials were rejected")]
    CredentialsRejected(String),

    /// The server requires authentication and nothing was configured.
    #[error("{0} requires authentication - add an Authorization header or configure OAuth")]
    AuthRequired(String),

    /// Fresh tokens were issued but the server still rejects them.
    #[error("Authorization loop detected for {0} - re-authentication succeeded but the server still returns 401")]
    AuthLoop(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file error.
    #[error("Config error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),
}

impl ClientError {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a tool error.
    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool(message.into())
    }

    /// Whether the server answered "method not found". Callers treat lists
    /// the server advertises but does not implement as empty.
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self,
            Self::Rpc {
                code: crate::protocol::METHOD_NOT_FOUND,
                ..
            }
        )
    }

    /// Whether this error means the server wants authentication.
    pub fn is_auth_required(&self) -> bool {
        match self {
            Self::Transport(e) => matches!(e.classify(), crate::transport::ErrorClass::AuthRequired),
            Self::CredentialsRejected(_) | Self::AuthRequired(_) | Self::AuthLoop(_) => true,
            _ => false,
        }
    }
}
