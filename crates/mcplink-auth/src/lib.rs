//! OAuth 2.0 authorization for MCP servers.
//!
//! Implements the authorization code flow with PKCE: metadata discovery,
//! dynamic client registration, a loopback callback server, token exchange,
//! and refresh. Tokens and flow state persist in a [`KeyValueStore`], keyed
//! by a hash of the server URL so one store serves many servers.
//!
//! ```no_run
//! use mcplink_auth::{FileStore, OAuthConfig, OAuthProvider};
//! use std::sync::Arc;
//!
//! # async fn run() -> mcplink_auth::AuthResult<()> {
//! let store = Arc::new(FileStore::new()?);
//! let provider = OAuthProvider::new(
//!     "https://mcp.example.com/sse",
//!     OAuthConfig::default(),
//!     store,
//! );
//!
//! if provider.access_token().await?.is_none() {
//!     provider.authorize().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod browser;
pub mod callback;
pub mod error;
pub mod metadata;
pub mod pkce;
pub mod provider;
pub mod store;

pub use callback::{CallbackServer, CALLBACK_PATH, CALLBACK_TIMEOUT_SECS, DEFAULT_CALLBACK_PORT};
pub use error::{AuthError, AuthResult};
pub use metadata::{ClientInfo, OAuthMetadata, OAuthTokens};
pub use provider::{
    server_url_hash, AuthFlow, OAuthConfig, OAuthProvider, PreparedAuth, StoredTokens,
    REFRESH_SAFETY_WINDOW_SECS, STATE_TTL_SECS,
};
pub use store::{FileStore, KeyValueStore, MemoryStore};

/// Default location of the shared token store.
pub fn default_store_path() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|dir| dir.join("mcplink").join("oauth.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_store_path_shape() {
        if let Some(path) = default_store_path() {
            assert!(path.ends_with("mcplink/oauth.json"));
        }
    }
}
