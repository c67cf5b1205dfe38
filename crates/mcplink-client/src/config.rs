//! Server configuration loading.
//!
//! Servers are declared in a JSON file using the conventional `mcpServers`
//! shape, where the map key is the server name:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "web": {
//!       "url": "https://example.com/mcp",
//!       "headers": { "Authorization": "Bearer ..." },
//!       "transport": "auto",
//!       "auth": { "scope": "mcp:tools", "clientName": "my-agent" },
//!       "autoReconnect": true
//!     }
//!   }
//! }
//! ```

use crate::connector::TransportPreference;
use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Server entries keyed by name.
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Configuration for one MCP server. The server name is the key under
/// `mcpServers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server endpoint URL.
    pub url: String,

    /// Headers sent with every request (API keys, static bearer tokens).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Transport selection. Defaults to auto-detection with fallback.
    #[serde(default)]
    pub transport: TransportPreference,

    /// OAuth settings. Presence enables the OAuth provider for this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Whether the server is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reconnect automatically when an established connection drops.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

/// OAuth settings for a server entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Requested scope, when the server expects one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Client name sent during dynamic registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            transport: TransportPreference::default(),
            auth: None,
            enabled: true,
            auto_reconnect: true,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Disable the server.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl McpConfig {
    /// Load configuration from a file.
    pub async fn load(path: &Path) -> ClientResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ClientError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ClientError::Config(format!("Invalid config {}: {e}", path.display()))
        })
    }

    /// The default config file location.
    ///
    /// On Unix systems, prefers `~/.config/mcplink/config.json` (XDG
    /// standard) for compatibility with other CLI tools.
    pub fn default_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                return Some(home.join(".config").join("mcplink").join("config.json"));
            }
        }
        dirs::config_dir().map(|d| d.join("mcplink").join("config.json"))
    }

    /// Look up a server entry by name.
    pub fn server(&self, name: &str) -> ClientResult<&ServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| ClientError::ServerNotFound(name.to_string()))
    }
}
