//! Connector: owns one server connection end to end.
//!
//! A connector ties together exactly one transport, one optional OAuth
//! provider and the caches for what the server offers. Connecting picks
//! the transport (streamable HTTP first, classified fallback to SSE),
//! runs the initialize handshake and eagerly fetches tools; resources,
//! resource templates and prompts are fetched on first use.

use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    CallToolParams, GetPromptResult, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListRootsResult, McpPrompt, McpResource, McpTool,
    ReadResourceResult, ResourceTemplate, Root, ServerCapabilities, ServerInfo, ToolCallResult,
    METHOD_NOT_FOUND,
};
use crate::transport::{
    ErrorClass, FallbackReason, Transport, TransportEvent, TransportFactory, TransportKind,
};
use mcplink_auth::OAuthProvider;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Budget for the initialize exchange, deliberately shorter than the
/// general request timeout so a dead endpoint fails fast.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default deadline for ordinary requests.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default deadline for tool calls. Progress notifications from the
/// server reset it, so slow tools stay alive as long as they report.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Which transport to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportPreference {
    /// Streamable HTTP first, fall back to SSE when the failure says the
    /// server speaks the older protocol.
    #[default]
    Auto,
    /// Config files commonly spell this "http".
    #[serde(alias = "http")]
    StreamableHttp,
    Sse,
}

/// Connection settings for one server.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Display name, used in errors and logs.
    pub name: String,
    /// Server endpoint URL.
    pub url: String,
    /// Custom headers for every request (API keys, static bearer tokens).
    pub headers: HashMap<String, String>,
    pub transport: TransportPreference,
    pub request_timeout_secs: u64,
    pub tool_timeout_secs: u64,
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: HashMap::new(),
            transport: TransportPreference::Auto,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport = transport;
        self
    }
}

/// Credential source for a connector. Implemented by the OAuth provider;
/// tests substitute their own.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// A usable bearer token, refreshed if needed. None means the
    /// interactive flow has to run first.
    async fn access_token(&self) -> ClientResult<Option<String>>;

    /// Run the interactive authorization flow to completion.
    async fn authorize(&self) -> ClientResult<()>;

    /// URL of the authorization page, for surfacing to the user while the
    /// flow is pending.
    async fn auth_url(&self) -> Option<String>;

    /// Drop everything persisted for this server. Returns how many records
    /// were removed.
    async fn clear(&self) -> ClientResult<usize>;
}

#[async_trait]
impl Authenticator for OAuthProvider {
    async fn access_token(&self) -> ClientResult<Option<String>> {
        Ok(OAuthProvider::access_token(self).await?)
    }

    async fn authorize(&self) -> ClientResult<()> {
        OAuthProvider::authorize(self).await?;
        Ok(())
    }

    async fn auth_url(&self) -> Option<String> {
        OAuthProvider::last_auth_url(self).await.ok().flatten()
    }

    async fn clear(&self) -> ClientResult<usize> {
        Ok(OAuthProvider::clear_storage(self).await?)
    }
}

/// Connector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct Connector {
    config: ConnectorConfig,
    factory: Arc<dyn TransportFactory>,
    authenticator: Option<Arc<dyn Authenticator>>,
    state: Arc<RwLock<ConnectorState>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_id: AtomicU64,
    server_info: RwLock<Option<ServerInfo>>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    /// Tools are the primary surface and are fetched at connect time.
    tools: RwLock<Vec<McpTool>>,
    /// Lazy caches: None until first fetched.
    resources: RwLock<Option<Vec<McpResource>>>,
    resource_templates: RwLock<Option<Vec<ResourceTemplate>>>,
    prompts: RwLock<Option<Vec<McpPrompt>>>,
    roots: Arc<RwLock<Vec<Root>>>,
    /// Server-initiated traffic, re-broadcast for sessions and tool calls.
    events: broadcast::Sender<TransportEvent>,
    /// Serializes connection attempts.
    connect_lock: Mutex<()>,
    router_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        factory: Arc<dyn TransportFactory>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            factory,
            authenticator,
            state: Arc::new(RwLock::new(ConnectorState::Disconnected)),
            transport: RwLock::new(None),
            next_id: AtomicU64::new(1),
            server_info: RwLock::new(None),
            capabilities: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(None),
            resource_templates: RwLock::new(None),
            prompts: RwLock::new(None),
            roots: Arc::new(RwLock::new(Vec::new())),
            events,
            connect_lock: Mutex::new(()),
            router_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.authenticator.clone()
    }

    /// Whether the user supplied their own headers. Shapes the error
    /// message when the server rejects us.
    pub fn has_custom_headers(&self) -> bool {
        !self.config.headers.is_empty()
    }

    pub async fn state(&self) -> ConnectorState {
        *self.state.read().await
    }

    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.read().await.as_ref().map(|t| t.kind())
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.read().await.clone()
    }

    /// Server-initiated notifications and lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connect and run the handshake. Connecting while already connected is
    /// a no-op; concurrent calls share one attempt.
    pub async fn connect(&self) -> ClientResult<()> {
        let _guard = self.connect_lock.lock().await;
        if *self.state.read().await == ConnectorState::Connected {
            debug!(server = %self.config.name, "Already connected, ignoring connect");
            return Ok(());
        }
        *self.state.write().await = ConnectorState::Connecting;

        let bearer = match &self.authenticator {
            Some(auth) => auth.access_token().await?,
            None => None,
        };

        let result = match self.config.transport {
            TransportPreference::StreamableHttp => {
                self.try_transport(TransportKind::StreamableHttp, bearer).await
            }
            TransportPreference::Sse => self.try_transport(TransportKind::Sse, bearer).await,
            TransportPreference::Auto => {
                match self
                    .try_transport(TransportKind::StreamableHttp, bearer.clone())
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) => match classify_failure(&e) {
                        ErrorClass::Fallback(reason) => {
                            if reason == FallbackReason::MissingSessionId {
                                warn!(
                                    server = %self.config.name,
                                    "Server rejected the request for lack of a session id; \
                                     this matches FastMCP's legacy SSE behavior"
                                );
                            }
                            info!(
                                server = %self.config.name,
                                reason = %reason,
                                "Streamable HTTP failed, falling back to SSE"
                            );
                            self.try_transport(TransportKind::Sse, bearer).await
                        }
                        // An auth demand would be rejected identically on
                        // the other transport; fatal errors stand.
                        ErrorClass::AuthRequired | ErrorClass::Fatal => Err(e),
                    },
                }
            }
        };

        match result {
            Ok(()) => {
                *self.state.write().await = ConnectorState::Connected;
                Ok(())
            }
            Err(e) => {
                self.teardown_transport().await;
                *self.state.write().await = ConnectorState::Disconnected;
                Err(e)
            }
        }
    }

    async fn try_transport(
        &self,
        kind: TransportKind,
        bearer: Option<String>,
    ) -> ClientResult<()> {
        // At most one live transport. Close the previous one before the
        // replacement opens.
        self.teardown_transport().await;

        info!(server = %self.config.name, transport = %kind, "Connecting");
        let transport = self.factory.build(kind, bearer).await?;
        transport.connect().await?;

        // The router answers server requests (roots/list in particular),
        // so it has to be live before the handshake, not after.
        self.spawn_router(Arc::clone(&transport)).await;
        *self.transport.write().await = Some(transport);

        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown_transport().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> ClientResult<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self
            .rpc_result_with_timeout("initialize", Some(params), HANDSHAKE_TIMEOUT_SECS)
            .await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ClientError::InitializationFailed(e.to_string()))?;

        info!(
            server = %self.config.name,
            name = %init.server_info.name,
            protocol = %init.protocol_version,
            "Server initialized"
        );
        *self.server_info.write().await = Some(init.server_info);
        *self.capabilities.write().await = Some(init.capabilities);

        self.notify("notifications/initialized", None).await?;

        let tools = if self.advertises_tools().await {
            self.fetch_all_pages::<McpTool>("tools/list", "tools").await?
        } else {
            debug!(server = %self.config.name, "Server does not advertise tools");
            Vec::new()
        };
        info!(server = %self.config.name, count = tools.len(), "Tools loaded");
        *self.tools.write().await = tools;

        *self.resources.write().await = None;
        *self.resource_templates.write().await = None;
        *self.prompts.write().await = None;
        Ok(())
    }

    /// Disconnect, best effort. Never fails; returns how many cleanup
    /// steps did.
    pub async fn disconnect(&self) -> usize {
        let mut failed_steps = 0;

        if let Some(handle) = self.router_task.lock().await.take() {
            handle.abort();
        }
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(server = %self.config.name, error = %e, "Transport close failed");
                failed_steps += 1;
            }
        }

        *self.server_info.write().await = None;
        *self.capabilities.write().await = None;
        self.tools.write().await.clear();
        *self.resources.write().await = None;
        *self.resource_templates.write().await = None;
        *self.prompts.write().await = None;
        *self.state.write().await = ConnectorState::Disconnected;

        if failed_steps > 0 {
            warn!(server = %self.config.name, failed_steps, "Disconnected with failures");
        } else {
            info!(server = %self.config.name, "Disconnected");
        }
        failed_steps
    }

    async fn teardown_transport(&self) {
        if let Some(handle) = self.router_task.lock().await.take() {
            handle.abort();
        }
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(server = %self.config.name, error = %e, "Transport close failed");
            }
        }
    }

    /// Route server-initiated traffic: answer requests, forward the rest.
    async fn spawn_router(&self, transport: Arc<dyn Transport>) {
        let mut rx = transport.subscribe();
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let roots = Arc::clone(&self.roots);
        let name = self.config.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Request(request)) => {
                        answer_server_request(&name, &transport, &roots, request).await;
                    }
                    Ok(TransportEvent::Notification(notification)) => {
                        let _ = events.send(TransportEvent::Notification(notification));
                    }
                    Ok(TransportEvent::Closed) => {
                        debug!(server = %name, "Transport closed");
                        *state.write().await = ConnectorState::Disconnected;
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(server = %name, skipped, "Event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.router_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    async fn current_transport(&self) -> ClientResult<Arc<dyn Transport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| ClientError::NotConnected(self.config.name.clone()))
    }

    async fn rpc_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_secs: u64,
    ) -> ClientResult<JsonRpcResponse> {
        let transport = self.current_transport().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            transport.request(request),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::Timeout(timeout_secs)),
        }
    }

    async fn rpc_result_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_secs: u64,
    ) -> ClientResult<Value> {
        let response = self.rpc_with_timeout(method, params, timeout_secs).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| ClientError::protocol(format!("{method} returned no result")))
    }

    async fn rpc_result(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        self.rpc_result_with_timeout(method, params, self.config.request_timeout_secs)
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> ClientResult<()> {
        let transport = self.current_transport().await?;
        transport
            .notify(JsonRpcNotification::new(method, params))
            .await?;
        Ok(())
    }

    /// Walk a paginated list to the end. A method-not-found answer means
    /// the server advertised the capability but does not implement the
    /// list; treat it as empty rather than failing the caller.
    async fn fetch_all_pages<T: DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> ClientResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = match self.rpc_result(method, params).await {
                Ok(value) => value,
                Err(e) if e.is_method_not_found() => {
                    debug!(server = %self.config.name, method, "Advertised but not implemented");
                    return Ok(items);
                }
                Err(e) => return Err(e),
            };

            if let Some(page) = result.get(key) {
                let page: Vec<T> = serde_json::from_value(page.clone())?;
                items.extend(page);
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    async fn advertises_tools(&self) -> bool {
        self.capabilities
            .read()
            .await
            .as_ref()
            .map(|c| c.tools.is_some())
            .unwrap_or(false)
    }

    async fn advertises_resources(&self) -> bool {
        self.capabilities
            .read()
            .await
            .as_ref()
            .map(|c| c.resources.is_some())
            .unwrap_or(false)
    }

    async fn advertises_prompts(&self) -> bool {
        self.capabilities
            .read()
            .await
            .as_ref()
            .map(|c| c.prompts.is_some())
            .unwrap_or(false)
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Cached tool list, loaded at connect time.
    pub async fn tools(&self) -> Vec<McpTool> {
        self.tools.read().await.clone()
    }

    /// Refetch the tool list. The cache is replaced only on success.
    pub async fn refresh_tools(&self) -> ClientResult<Vec<McpTool>> {
        let tools = self.fetch_all_pages::<McpTool>("tools/list", "tools").await?;
        *self.tools.write().await = tools.clone();
        Ok(tools)
    }

    /// Call a tool. A progress token is always attached so servers that
    /// report progress keep long calls alive past the base deadline.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<ToolCallResult> {
        let transport = self.current_transport().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
            meta: Some(serde_json::json!({ "progressToken": id })),
        };
        let request = JsonRpcRequest::new(id, "tools/call", Some(serde_json::to_value(&params)?));

        // Subscribe before sending so no progress notification is missed.
        let mut events = self.events.subscribe();
        let request_fut = transport.request(request);
        tokio::pin!(request_fut);

        let timeout = Duration::from_secs(self.config.tool_timeout_secs);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut request_fut => {
                    let response = result?;
                    if let Some(error) = response.error {
                        return Err(ClientError::Rpc {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    let result = response
                        .result
                        .ok_or_else(|| ClientError::protocol("tools/call returned no result"))?;
                    return Ok(serde_json::from_value(result)?);
                }
                event = events.recv() => {
                    if let Ok(TransportEvent::Notification(n)) = event {
                        if n.method == "notifications/progress" && progress_matches(&n, id) {
                            debug!(server = %self.config.name, tool = name, "Progress received");
                            deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                        }
                    }
                }
                () = &mut deadline => {
                    warn!(server = %self.config.name, tool = name, "Tool call timed out");
                    return Err(ClientError::Timeout(self.config.tool_timeout_secs));
                }
            }
        }
    }

    /// Lightweight liveness probe.
    pub async fn ping(&self) -> ClientResult<()> {
        self.rpc_result("ping", None).await.map(|_| ())
    }

    // ========================================================================
    // Resources and prompts (fetched lazily)
    // ========================================================================

    pub async fn list_resources(&self) -> ClientResult<Vec<McpResource>> {
        if let Some(cached) = self.resources.read().await.clone() {
            return Ok(cached);
        }
        self.refresh_resources().await
    }

    pub async fn refresh_resources(&self) -> ClientResult<Vec<McpResource>> {
        self.current_transport().await?;
        let resources = if self.advertises_resources().await {
            self.fetch_all_pages::<McpResource>("resources/list", "resources")
                .await?
        } else {
            Vec::new()
        };
        *self.resources.write().await = Some(resources.clone());
        Ok(resources)
    }

    pub async fn list_resource_templates(&self) -> ClientResult<Vec<ResourceTemplate>> {
        if let Some(cached) = self.resource_templates.read().await.clone() {
            return Ok(cached);
        }
        self.refresh_resource_templates().await
    }

    pub async fn refresh_resource_templates(&self) -> ClientResult<Vec<ResourceTemplate>> {
        self.current_transport().await?;
        let templates = if self.advertises_resources().await {
            self.fetch_all_pages::<ResourceTemplate>(
                "resources/templates/list",
                "resourceTemplates",
            )
            .await?
        } else {
            Vec::new()
        };
        *self.resource_templates.write().await = Some(templates.clone());
        Ok(templates)
    }

    pub async fn read_resource(&self, uri: &str) -> ClientResult<ReadResourceResult> {
        let result = self
            .rpc_result("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_prompts(&self) -> ClientResult<Vec<McpPrompt>> {
        if let Some(cached) = self.prompts.read().await.clone() {
            return Ok(cached);
        }
        self.refresh_prompts().await
    }

    pub async fn refresh_prompts(&self) -> ClientResult<Vec<McpPrompt>> {
        self.current_transport().await?;
        let prompts = if self.advertises_prompts().await {
            self.fetch_all_pages::<McpPrompt>("prompts/list", "prompts")
                .await?
        } else {
            Vec::new()
        };
        *self.prompts.write().await = Some(prompts.clone());
        Ok(prompts)
    }

    /// Cached resources, without triggering a fetch. None until first listed.
    pub async fn cached_resources(&self) -> Option<Vec<McpResource>> {
        self.resources.read().await.clone()
    }

    /// Cached resource templates, without triggering a fetch.
    pub async fn cached_resource_templates(&self) -> Option<Vec<ResourceTemplate>> {
        self.resource_templates.read().await.clone()
    }

    /// Cached prompts, without triggering a fetch. None until first listed.
    pub async fn cached_prompts(&self) -> Option<Vec<McpPrompt>> {
        self.prompts.read().await.clone()
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<GetPromptResult> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self.rpc_result("prompts/get", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Replace the advertised roots and tell the server, if connected.
    pub async fn set_roots(&self, roots: Vec<Root>) -> ClientResult<()> {
        *self.roots.write().await = roots;
        if *self.state.read().await == ConnectorState::Connected {
            self.notify("notifications/roots/list_changed", None).await?;
        }
        Ok(())
    }

    pub async fn roots(&self) -> Vec<Root> {
        self.roots.read().await.clone()
    }
}

/// Answer a request the server sent us. Only `roots/list` and `ping` are
/// supported; everything else gets a method-not-found error.
async fn answer_server_request(
    name: &str,
    transport: &Arc<dyn Transport>,
    roots: &Arc<RwLock<Vec<Root>>>,
    request: JsonRpcRequest,
) {
    let id = match request.id {
        Some(id) => id,
        None => return,
    };

    let response = match request.method.as_str() {
        "roots/list" => {
            let roots = roots.read().await.clone();
            debug!(server = %name, count = roots.len(), "Answering roots/list");
            match serde_json::to_value(ListRootsResult { roots }) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, -32603, e.to_string()),
            }
        }
        "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
        other => {
            debug!(server = %name, method = other, "Rejecting unsupported server request");
            JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}"))
        }
    };

    if let Err(e) = transport.respond(response).await {
        warn!(server = %name, error = %e, "Failed to answer server request");
    }
}

fn classify_failure(error: &ClientError) -> ErrorClass {
    match error {
        ClientError::Transport(e) => e.classify(),
        _ => ErrorClass::Fatal,
    }
}

fn progress_matches(notification: &JsonRpcNotification, id: u64) -> bool {
    let Some(token) = notification
        .params
        .as_ref()
        .and_then(|p| p.get("progressToken"))
    else {
        return false;
    };
    token.as_u64() == Some(id) || token.as_str() == Some(id.to_string().as_str())
}
