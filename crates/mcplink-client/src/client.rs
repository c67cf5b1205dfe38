//! Multi-server client: a named-session registry.
//!
//! `McpClient` owns one [`McpSession`] per configured server. It is an
//! explicit handle: construct it, pass it around, drop it when done.
//! Nothing here is global.

use crate::config::{McpConfig, ServerConfig};
use crate::connector::{Authenticator, Connector, ConnectorConfig};
use crate::error::{ClientError, ClientResult};
use crate::session::{McpSession, SessionConfig};
use crate::transport::HttpTransportFactory;
use mcplink_auth::{FileStore, KeyValueStore, OAuthConfig, OAuthProvider};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub struct McpClient {
    /// Declared servers, by name.
    configs: RwLock<HashMap<String, ServerConfig>>,
    /// Live sessions, by name.
    sessions: RwLock<HashMap<String, Arc<McpSession>>>,
    /// Token store shared by every OAuth provider. Created on first use so
    /// servers without auth never touch the filesystem.
    store: Mutex<Option<Arc<dyn KeyValueStore>>>,
}

impl McpClient {
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            store: Mutex::new(None),
        }
    }

    /// Build a client from parsed configuration.
    pub async fn from_config(config: McpConfig) -> Self {
        let client = Self::new();
        for (name, server) in config.servers {
            client.add_server(name, server).await;
        }
        client
    }

    /// Build a client from a config file.
    pub async fn from_config_file(path: &Path) -> ClientResult<Self> {
        let config = McpConfig::load(path).await?;
        Ok(Self::from_config(config).await)
    }

    /// Use a specific token store instead of the default file-backed one.
    pub async fn with_token_store(self, store: Arc<dyn KeyValueStore>) -> Self {
        *self.store.lock().await = Some(store);
        self
    }

    /// Register a server. Does not connect; an existing live session for
    /// the name keeps running with its old settings.
    pub async fn add_server(&self, name: impl Into<String>, config: ServerConfig) {
        let name = name.into();
        debug!(server = %name, url = %config.url, "Registered server");
        self.configs.write().await.insert(name, config);
    }

    /// Unregister a server, disconnecting its session if one is live.
    pub async fn remove_server(&self, name: &str) {
        self.configs.write().await.remove(name);
        let session = self.sessions.write().await.remove(name);
        if let Some(session) = session {
            session.disconnect().await;
            info!(server = %name, "Removed server");
        }
    }

    /// Names of all registered servers.
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The live session for a server, if one was created.
    pub async fn get_session(&self, name: &str) -> Option<Arc<McpSession>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Create the session for a named server and connect it. Idempotent:
    /// an existing session is reconnected rather than replaced. On failure
    /// the session stays registered so the caller can inspect it or retry.
    pub async fn create_session(&self, name: &str) -> ClientResult<Arc<McpSession>> {
        let session = match self.get_session(name).await {
            Some(existing) => existing,
            None => {
                let session = self.build_session(name).await?;
                self.sessions
                    .write()
                    .await
                    .insert(name.to_string(), Arc::clone(&session));
                session
            }
        };
        session.connect().await?;
        Ok(session)
    }

    /// Connect every enabled server. Failures are logged and skipped;
    /// returns the names that connected or parked in an auth flow.
    pub async fn create_all_sessions(&self) -> Vec<String> {
        let names = self.server_names().await;
        let mut connected = Vec::new();
        for name in names {
            let enabled = self
                .configs
                .read()
                .await
                .get(&name)
                .map(|c| c.enabled)
                .unwrap_or(false);
            if !enabled {
                debug!(server = %name, "Server is disabled, skipping");
                continue;
            }
            match self.create_session(&name).await {
                Ok(_) => connected.push(name),
                Err(e) => warn!(server = %name, error = %e, "Failed to connect"),
            }
        }
        connected
    }

    /// Disconnect and drop every session. Best-effort: cleanup failures
    /// are logged, never returned.
    pub async fn close_all_sessions(&self) {
        let sessions: Vec<(String, Arc<McpSession>)> =
            self.sessions.write().await.drain().collect();
        for (name, session) in sessions {
            let failed_steps = session.disconnect().await;
            if failed_steps > 0 {
                warn!(server = %name, failed_steps, "Session did not close cleanly");
            }
        }
    }

    async fn build_session(&self, name: &str) -> ClientResult<Arc<McpSession>> {
        let config = {
            let configs = self.configs.read().await;
            configs
                .get(name)
                .cloned()
                .ok_or_else(|| ClientError::ServerNotFound(name.to_string()))?
        };
        if !config.enabled {
            return Err(ClientError::Config(format!("Server {name} is disabled")));
        }

        let connector_config = ConnectorConfig::new(name, &config.url)
            .with_transport(config.transport);
        let connector_config = config
            .headers
            .iter()
            .fold(connector_config, |c, (k, v)| c.with_header(k, v));

        let factory = Arc::new(HttpTransportFactory::new(
            &config.url,
            config.headers.clone(),
            connector_config.request_timeout_secs,
        ));

        let authenticator: Option<Arc<dyn Authenticator>> = match &config.auth {
            Some(auth) => {
                let oauth_config = OAuthConfig {
                    scope: auth.scope.clone(),
                    client_name: auth
                        .client_name
                        .clone()
                        .unwrap_or_else(|| "mcplink".to_string()),
                    ..OAuthConfig::default()
                };
                let provider =
                    OAuthProvider::new(&config.url, oauth_config, self.token_store().await?);
                Some(Arc::new(provider))
            }
            None => None,
        };

        let session_config = SessionConfig {
            auto_reconnect: config.auto_reconnect,
            ..SessionConfig::default()
        };

        let connector = Arc::new(Connector::new(connector_config, factory, authenticator));
        Ok(Arc::new(McpSession::new(connector, session_config)))
    }

    async fn token_store(&self) -> ClientResult<Arc<dyn KeyValueStore>> {
        let mut slot = self.store.lock().await;
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new()?);
        *slot = Some(Arc::clone(&store));
        Ok(store)
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}
