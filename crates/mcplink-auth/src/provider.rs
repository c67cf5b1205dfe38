//! OAuth 2.0 client provider with PKCE.
//!
//! One provider instance serves one MCP server URL. All persisted records
//! are namespaced by a hash of that URL so several servers can share a
//! single store. In-flight authorizations are tracked as `state_{state}`
//! records with a short expiry; a callback whose state record is missing,
//! corrupt, or expired is rejected.

use crate::browser;
use crate::callback::{CallbackServer, CALLBACK_TIMEOUT_SECS, DEFAULT_CALLBACK_PORT};
use crate::error::{AuthError, AuthResult};
use crate::metadata::{self, ClientInfo, OAuthMetadata, OAuthTokens};
use crate::pkce;
use crate::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How long a pending authorization state stays valid.
pub const STATE_TTL_SECS: u64 = 600;

/// Refresh tokens this many seconds before they actually expire.
pub const REFRESH_SAFETY_WINDOW_SECS: u64 = 60;

/// How the authorization URL reaches the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthFlow {
    /// Spawn the system browser. Failure to spawn is non-fatal; the URL is
    /// logged either way.
    #[default]
    Browser,
    /// Only log the URL. The host application presents it to the user.
    Manual,
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Pre-registered client id. When absent the provider registers one
    /// dynamically.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    /// Client name sent during dynamic registration.
    pub client_name: String,
    pub flow: AuthFlow,
    pub callback_port: u16,
    pub callback_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            scope: None,
            client_name: "mcplink".to_string(),
            flow: AuthFlow::default(),
            callback_port: DEFAULT_CALLBACK_PORT,
            callback_timeout_secs: CALLBACK_TIMEOUT_SECS,
        }
    }
}

/// Tokens at rest, with an absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp in seconds. `None` means the server did not say.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl StoredTokens {
    /// Whether the access token is still usable without a refresh.
    pub fn is_fresh(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now + REFRESH_SAFETY_WINDOW_SECS,
            None => true,
        }
    }
}

/// Pending authorization at rest.
#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    server_url_hash: String,
    server_url: String,
    redirect_uri: String,
    #[serde(default)]
    flow: AuthFlow,
    created_at: u64,
    expires_at: u64,
}

/// An authorization URL ready to hand to the user.
#[derive(Debug, Clone)]
pub struct PreparedAuth {
    pub url: String,
    pub state: String,
}

/// OAuth client provider for a single server URL.
pub struct OAuthProvider {
    server_url: String,
    hash: String,
    config: OAuthConfig,
    store: Arc<dyn KeyValueStore>,
    http: reqwest::Client,
    metadata: RwLock<Option<OAuthMetadata>>,
}

impl OAuthProvider {
    pub fn new(
        server_url: impl Into<String>,
        config: OAuthConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let server_url = server_url.into();
        let hash = server_url_hash(&server_url);
        Self {
            server_url,
            hash,
            config,
            store,
            http: reqwest::Client::new(),
            metadata: RwLock::new(None),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.hash)
    }

    // === Tokens ===

    /// A valid access token, refreshing if one is stored but stale.
    ///
    /// Returns `None` when no usable token exists; the caller decides
    /// whether to start an interactive authorization.
    pub async fn access_token(&self) -> AuthResult<Option<String>> {
        let Some(tokens) = self.tokens().await? else {
            return Ok(None);
        };

        if tokens.is_fresh(now_secs()) {
            return Ok(Some(tokens.access_token));
        }

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            debug!(server = %self.server_url, "Access token expired and no refresh token stored");
            return Ok(None);
        };

        match self.refresh(&refresh_token, tokens).await {
            Ok(stored) => Ok(Some(stored.access_token)),
            Err(e) => {
                warn!(server = %self.server_url, error = %e, "Token refresh failed");
                Ok(None)
            }
        }
    }

    /// The stored tokens, if any. Corrupt records are deleted on read.
    pub async fn tokens(&self) -> AuthResult<Option<StoredTokens>> {
        let key = self.key("tokens");
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding corrupt token record");
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Persist tokens from a token endpoint response.
    ///
    /// Also deletes the code verifier and last authorization URL: the flow
    /// that produced them is finished.
    pub async fn save_tokens(
        &self,
        tokens: OAuthTokens,
        prior_refresh: Option<String>,
    ) -> AuthResult<StoredTokens> {
        let stored = StoredTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(prior_refresh),
            expires_at: tokens.expires_in.map(|secs| now_secs() + secs),
            scope: tokens.scope,
        };
        self.store
            .set(&self.key("tokens"), serde_json::to_string(&stored)?)
            .await?;
        self.store.delete(&self.key("code_verifier")).await?;
        self.store.delete(&self.key("last_auth_url")).await?;
        Ok(stored)
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        prior: StoredTokens,
    ) -> AuthResult<StoredTokens> {
        let meta = self.ensure_metadata().await?;
        let token_endpoint = meta
            .token_endpoint
            .ok_or_else(|| AuthError::Discovery("metadata has no token endpoint".to_string()))?;
        let client = self.stored_client().await?.ok_or_else(|| {
            AuthError::TokenExchange("no client registered for refresh".to_string())
        })?;

        let response = metadata::refresh_tokens(
            &self.http,
            &token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            refresh_token,
        )
        .await?;

        debug!(server = %self.server_url, "Refreshed access token");
        self.save_tokens(response, prior.refresh_token).await
    }

    // === Metadata and client registration ===

    /// Discovered server metadata, cached after the first call.
    pub async fn ensure_metadata(&self) -> AuthResult<OAuthMetadata> {
        if let Some(meta) = self.metadata.read().await.as_ref() {
            return Ok(meta.clone());
        }

        let discovered = metadata::discover(&self.http, &self.server_url)
            .await?
            .ok_or_else(|| {
                AuthError::Discovery(format!(
                    "{} does not advertise OAuth metadata",
                    self.server_url
                ))
            })?;

        let mut cache = self.metadata.write().await;
        *cache = Some(discovered.clone());
        Ok(discovered)
    }

    async fn stored_client(&self) -> AuthResult<Option<ClientInfo>> {
        if let Some(client_id) = self.config.client_id.clone() {
            return Ok(Some(ClientInfo {
                client_id,
                client_secret: self.config.client_secret.clone(),
                client_id_issued_at: None,
                client_secret_expires_at: None,
            }));
        }

        let key = self.key("client_info");
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding corrupt client record");
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Client credentials, registering dynamically when none are configured
    /// or stored.
    pub async fn ensure_client(&self, redirect_uri: &str) -> AuthResult<ClientInfo> {
        if let Some(client) = self.stored_client().await? {
            return Ok(client);
        }

        let meta = self.ensure_metadata().await?;
        let registration_endpoint = meta.registration_endpoint.ok_or_else(|| {
            AuthError::Registration(
                "server does not support dynamic registration; configure a client_id".to_string(),
            )
        })?;

        let info = metadata::register_client(
            &self.http,
            &registration_endpoint,
            &self.config.client_name,
            redirect_uri,
        )
        .await?;

        info!(server = %self.server_url, client_id = %info.client_id, "Registered OAuth client");
        self.store
            .set(&self.key("client_info"), serde_json::to_string(&info)?)
            .await?;
        Ok(info)
    }

    // === Authorization flow ===

    /// Build the authorization URL and persist the flow state.
    ///
    /// Stores the PKCE verifier, a `state_{state}` record bound to this
    /// server, and the URL itself for later display.
    pub async fn prepare_authorization(&self, redirect_uri: &str) -> AuthResult<PreparedAuth> {
        let meta = self.ensure_metadata().await?;
        let auth_endpoint = meta.authorization_endpoint.clone().ok_or_else(|| {
            AuthError::Discovery("metadata has no authorization endpoint".to_string())
        })?;
        let client = self.ensure_client(redirect_uri).await?;

        let verifier = pkce::generate_code_verifier();
        let challenge = pkce::code_challenge(&verifier);
        let state = pkce::generate_state();
        let now = now_secs();

        let record = StateRecord {
            server_url_hash: self.hash.clone(),
            server_url: self.server_url.clone(),
            redirect_uri: redirect_uri.to_string(),
            flow: self.config.flow,
            created_at: now,
            expires_at: now + STATE_TTL_SECS,
        };

        self.store
            .set(&self.key("code_verifier"), verifier)
            .await?;
        self.store
            .set(&format!("state_{state}"), serde_json::to_string(&record)?)
            .await?;

        let url = metadata::build_auth_url(
            &auth_endpoint,
            &client.client_id,
            redirect_uri,
            self.config.scope.as_deref(),
            &state,
            &challenge,
        );
        self.store
            .set(&self.key("last_auth_url"), url.clone())
            .await?;

        Ok(PreparedAuth { url, state })
    }

    /// Complete the flow with the code and state from the redirect.
    pub async fn handle_callback(&self, code: &str, state: &str) -> AuthResult<StoredTokens> {
        let state_key = format!("state_{state}");
        let Some(raw) = self.store.get(&state_key).await? else {
            return Err(AuthError::StateNotFound);
        };
        let record: StateRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %state_key, error = %e, "Discarding corrupt state record");
                self.store.delete(&state_key).await?;
                return Err(AuthError::StateNotFound);
            }
        };

        if record.expires_at <= now_secs() {
            self.store.delete(&state_key).await?;
            return Err(AuthError::StateExpired);
        }
        if record.server_url_hash != self.hash {
            return Err(AuthError::StateMismatch);
        }

        let verifier = self.code_verifier().await?;
        let meta = self.ensure_metadata().await?;
        let token_endpoint = meta
            .token_endpoint
            .ok_or_else(|| AuthError::Discovery("metadata has no token endpoint".to_string()))?;
        let client = self.ensure_client(&record.redirect_uri).await?;

        let tokens = metadata::exchange_code(
            &self.http,
            &token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            code,
            &record.redirect_uri,
            &verifier,
        )
        .await?;

        self.store.delete(&state_key).await?;
        let stored = self.save_tokens(tokens, None).await?;
        info!(server = %self.server_url, "Authorization complete");
        Ok(stored)
    }

    /// Run the full interactive flow: callback server, browser, exchange.
    pub async fn authorize(&self) -> AuthResult<StoredTokens> {
        let server = CallbackServer::bind(self.config.callback_port).await?;
        let prepared = self.prepare_authorization(&server.redirect_uri()).await?;

        match self.config.flow {
            AuthFlow::Browser => {
                if let Err(e) = browser::open(&prepared.url) {
                    warn!(error = %e, "Could not open browser; open the URL manually");
                }
                info!(url = %prepared.url, "Waiting for authorization in browser");
            }
            AuthFlow::Manual => {
                info!(url = %prepared.url, "Open this URL to authorize");
            }
        }

        let result = server
            .wait_for_callback(&prepared.state, self.config.callback_timeout_secs)
            .await;
        server.stop().await;

        let code = result?;
        self.handle_callback(&code, &prepared.state).await
    }

    /// The stored PKCE verifier for the in-flight flow.
    ///
    /// Missing verifier is an error: exchanging a code without it would be
    /// rejected by the server, so fail here with a useful message instead.
    pub async fn code_verifier(&self) -> AuthResult<String> {
        self.store
            .get(&self.key("code_verifier"))
            .await?
            .ok_or_else(|| AuthError::MissingCodeVerifier(self.server_url.clone()))
    }

    /// The most recently generated authorization URL, if a flow is pending.
    pub async fn last_auth_url(&self) -> AuthResult<Option<String>> {
        self.store.get(&self.key("last_auth_url")).await
    }

    // === Cleanup ===

    /// Delete everything stored for this server URL.
    ///
    /// Removes all records under this server's hash plus any state records
    /// that point at it. Corrupt state records are deleted too. Returns the
    /// number of records removed.
    pub async fn clear_storage(&self) -> AuthResult<usize> {
        let prefix = format!("{}_", self.hash);
        let mut removed = 0;

        for key in self.store.keys().await? {
            if key.starts_with(&prefix) {
                if self.store.delete(&key).await? {
                    removed += 1;
                }
                continue;
            }
            if let Some(rest) = key.strip_prefix("state_") {
                let matches = match self.store.get(&key).await? {
                    Some(raw) => match serde_json::from_str::<StateRecord>(&raw) {
                        Ok(record) => record.server_url_hash == self.hash,
                        // Corrupt records can never be completed; drop them.
                        Err(_) => true,
                    },
                    None => false,
                };
                if matches && self.store.delete(&key).await? {
                    debug!(state = %rest, "Removed pending authorization state");
                    removed += 1;
                }
            }
        }

        debug!(server = %self.server_url, removed, "Cleared OAuth storage");
        Ok(removed)
    }
}

/// First 16 hex characters of the SHA-256 of the server URL.
pub fn server_url_hash(server_url: &str) -> String {
    let digest = Sha256::digest(server_url.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
