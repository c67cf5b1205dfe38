//! Session: the observable connection state machine.
//!
//! A session wraps one connector and drives it through the connection
//! lifecycle, handling authentication recovery, automatic retry, health
//! monitoring and cache refreshes. Consumers watch it through
//! [`McpSession::subscribe`] and the snapshot getters; the heavy lifting
//! happens in background tasks holding only weak references, so dropping
//! the session tears everything down.

use crate::connector::{Authenticator, Connector};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    GetPromptResult, JsonRpcNotification, McpPrompt, McpResource, McpTool, ReadResourceResult,
    ResourceTemplate, ToolCallResult,
};
use crate::transport::TransportEvent;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before an automatic retry or reconnect.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// How often the health monitor pings the server.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// How long without a successful ping before the connection is declared
/// dead. Kept well above the interval so one slow answer is not fatal.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 120;

/// Budget for the interactive authorization flow.
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 300;

/// Settle delay between a finished authorization and the reconnect.
pub const DEFAULT_REAUTH_DELAY_MS: u64 = 500;

/// How many authorization rounds one connection cycle may consume before
/// the session declares an authorization loop.
const MAX_AUTH_ROUNDS: u32 = 2;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle or deciding what to do next.
    Discovering,
    /// Transport selection and handshake in progress.
    Connecting,
    /// Connected, loading the capability snapshot.
    Loading,
    /// Fully operational.
    Ready,
    /// Waiting for the user to complete authorization.
    PendingAuth,
    /// Authorization flow running.
    Authenticating,
    /// Gave up; `retry()` or auto-retry can start over.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::PendingAuth => "pending_auth",
            Self::Authenticating => "authenticating",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Severity of a [`SessionEvent::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events broadcast to session subscribers. The channel is fire and
/// forget: lagging receivers lose old events, the session never blocks.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ToolsChanged,
    ResourcesChanged,
    PromptsChanged,
    /// Authorization URL for the user to visit.
    AuthUrl(String),
    /// The authorization flow finished.
    AuthCompleted { success: bool, error: Option<String> },
    Log { level: LogLevel, message: String },
}

/// Session behavior knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect when an established connection drops.
    pub auto_reconnect: bool,
    /// Retry automatically after a failed connection attempt.
    pub auto_retry: bool,
    /// Drive the authorization flow without waiting for the user to ask.
    pub auto_auth: bool,
    pub retry_delay_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub auth_timeout_secs: u64,
    pub reauth_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            auto_retry: false,
            auto_auth: true,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            health_check_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            health_check_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            reauth_delay_ms: DEFAULT_REAUTH_DELAY_MS,
        }
    }
}

pub struct McpSession {
    connector: Arc<Connector>,
    config: SessionConfig,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    auth_url: RwLock<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
    /// Guards against overlapping connection attempts.
    connect_flight: AtomicBool,
    /// Guards against double-arming the retry timer.
    retry_scheduled: AtomicBool,
    /// Authorization rounds consumed this connection cycle.
    auth_rounds: AtomicU32,
    /// Cleared by disconnect; background tasks check it before touching
    /// observable state.
    alive: AtomicBool,
    /// Cancels the health monitor and event listener.
    monitor: Mutex<Option<CancellationToken>>,
    /// Serialize refreshes per list so overlapping list_changed
    /// notifications queue instead of racing.
    tools_refresh: Mutex<()>,
    resources_refresh: Mutex<()>,
    prompts_refresh: Mutex<()>,
}

impl fmt::Debug for McpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl McpSession {
    pub fn new(connector: Arc<Connector>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            connector,
            config,
            state: RwLock::new(ConnectionState::Discovering),
            last_error: RwLock::new(None),
            auth_url: RwLock::new(None),
            events,
            connect_flight: AtomicBool::new(false),
            retry_scheduled: AtomicBool::new(false),
            auth_rounds: AtomicU32::new(0),
            alive: AtomicBool::new(true),
            monitor: Mutex::new(None),
            tools_refresh: Mutex::new(()),
            resources_refresh: Mutex::new(()),
            prompts_refresh: Mutex::new(()),
        }
    }

    // ========================================================================
    // Observables
    // ========================================================================

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Last failure message, cleared when a new attempt starts.
    pub async fn error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// URL of a pending authorization, for the user to visit.
    pub async fn auth_url(&self) -> Option<String> {
        self.auth_url.read().await.clone()
    }

    pub async fn tools(&self) -> Vec<McpTool> {
        self.connector.tools().await
    }

    pub async fn resources(&self) -> Vec<McpResource> {
        self.connector.cached_resources().await.unwrap_or_default()
    }

    pub async fn prompts(&self) -> Vec<McpPrompt> {
        self.connector.cached_prompts().await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn name(&self) -> &str {
        self.connector.name()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drive the connection to a terminal outcome: `Ready` (Ok),
    /// authorization pending (Ok, watch the state), or `Failed` (Err).
    /// A second call while an attempt is in flight returns immediately.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<()> {
        if self
            .connect_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(server = %self.name(), "Connection attempt already in flight");
            return Ok(());
        }
        self.alive.store(true, Ordering::SeqCst);

        let result = self.connect_inner().await;
        // Released on every terminal outcome, including the pending-auth
        // branch, so the auth callback can start a fresh attempt.
        self.connect_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn connect_inner(self: &Arc<Self>) -> ClientResult<()> {
        *self.last_error.write().await = None;
        self.set_state(ConnectionState::Discovering).await;
        self.set_state(ConnectionState::Connecting).await;

        match self.connector.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Loading).await;
                let tools = self.connector.tools().await;
                self.emit(SessionEvent::ToolsChanged);

                self.auth_rounds.store(0, Ordering::SeqCst);
                *self.auth_url.write().await = None;
                self.spawn_monitor().await;
                self.set_state(ConnectionState::Ready).await;
                self.emit_log(
                    LogLevel::Info,
                    format!("Connected to {} ({} tools)", self.name(), tools.len()),
                );
                Ok(())
            }
            Err(e) if e.is_auth_required() => {
                warn!(server = %self.name(), error = %e, "Server requires authentication");
                self.begin_auth().await
            }
            Err(e) => {
                self.fail(e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Tear everything down and go idle. Never fails; returns the number
    /// of cleanup steps that did.
    pub async fn disconnect(&self) -> usize {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(token) = self.monitor.lock().await.take() {
            token.cancel();
        }
        let failed_steps = self.connector.disconnect().await;
        *self.last_error.write().await = None;
        *self.auth_url.write().await = None;
        self.set_state(ConnectionState::Discovering).await;
        failed_steps
    }

    /// Start over after a failure. A no-op when already connected.
    pub async fn retry(self: &Arc<Self>) -> ClientResult<()> {
        if self.state().await == ConnectionState::Ready {
            debug!(server = %self.name(), "Retry requested while ready, ignoring");
            return Ok(());
        }
        self.connect().await
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Start the authorization flow manually, regardless of state.
    pub async fn authenticate(self: &Arc<Self>) -> ClientResult<()> {
        let Some(auth) = self.connector.authenticator() else {
            return Err(ClientError::AuthRequired(self.name().to_string()));
        };
        self.auth_rounds.store(0, Ordering::SeqCst);
        if self.config.auto_auth {
            self.set_state(ConnectionState::Authenticating).await;
        } else {
            self.set_state(ConnectionState::PendingAuth).await;
        }
        self.spawn_authorize(auth);
        Ok(())
    }

    /// Wipe persisted credentials for this server. Returns how many
    /// records were removed.
    pub async fn clear_storage(&self) -> ClientResult<usize> {
        let Some(auth) = self.connector.authenticator() else {
            return Ok(0);
        };
        let removed = auth.clear().await?;
        *self.auth_url.write().await = None;
        self.auth_rounds.store(0, Ordering::SeqCst);
        info!(server = %self.name(), removed, "Cleared stored credentials");
        Ok(removed)
    }

    /// The three authentication branches: a configured OAuth provider
    /// starts the flow; custom headers mean the user's credentials were
    /// rejected; with neither, tell the user what to configure.
    async fn begin_auth(self: &Arc<Self>) -> ClientResult<()> {
        let name = self.name().to_string();
        let Some(auth) = self.connector.authenticator() else {
            let e = if self.connector.has_custom_headers() {
                ClientError::CredentialsRejected(name)
            } else {
                ClientError::AuthRequired(name)
            };
            self.fail(e.to_string()).await;
            return Err(e);
        };

        let rounds = self.auth_rounds.fetch_add(1, Ordering::SeqCst);
        if rounds >= MAX_AUTH_ROUNDS {
            // Fresh tokens were issued and the server still answers 401.
            // A third round would spin forever.
            let e = ClientError::AuthLoop(name);
            self.fail(e.to_string()).await;
            return Err(e);
        }

        if self.config.auto_auth {
            self.set_state(ConnectionState::Authenticating).await;
        } else {
            self.set_state(ConnectionState::PendingAuth).await;
        }
        self.spawn_authorize(auth);
        Ok(())
    }

    fn spawn_authorize(self: &Arc<Self>, auth: Arc<dyn Authenticator>) {
        let weak = Arc::downgrade(self);
        let timeout_secs = self.config.auth_timeout_secs;
        let flow_auth = Arc::clone(&auth);
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                flow_auth.authorize(),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "Authorization timed out after {timeout_secs} seconds"
                )),
            };
            if let Some(session) = weak.upgrade() {
                session.on_auth_outcome(outcome).await;
            }
        });

        // Surface the authorization URL once the provider persists it, so
        // a UI can show it even when the browser failed to open.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let Some(session) = weak.upgrade() else { return };
                if !session.alive.load(Ordering::SeqCst) {
                    return;
                }
                let state = session.state().await;
                if state != ConnectionState::PendingAuth
                    && state != ConnectionState::Authenticating
                {
                    return;
                }
                if let Some(url) = auth.auth_url().await {
                    *session.auth_url.write().await = Some(url.clone());
                    session.emit_log(
                        LogLevel::Info,
                        format!("Authorization required, visit {url}"),
                    );
                    session.emit(SessionEvent::AuthUrl(url));
                    return;
                }
            }
        });
    }

    async fn on_auth_outcome(self: &Arc<Self>, outcome: Result<(), String>) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        match outcome {
            Ok(()) => {
                self.emit(SessionEvent::AuthCompleted {
                    success: true,
                    error: None,
                });
                self.emit_log(LogLevel::Info, "Authorization complete, reconnecting".to_string());
                *self.auth_url.write().await = None;

                // Give storage and the server a moment to settle.
                tokio::time::sleep(Duration::from_millis(self.config.reauth_delay_ms)).await;
                let state = self.state().await;
                if self.alive.load(Ordering::SeqCst)
                    && (state == ConnectionState::Authenticating
                        || state == ConnectionState::PendingAuth)
                {
                    let _ = self.connect().await;
                }
            }
            Err(reason) => {
                self.emit(SessionEvent::AuthCompleted {
                    success: false,
                    error: Some(reason.clone()),
                });
                self.fail(format!("Authorization failed: {reason}")).await;
            }
        }
    }

    // ========================================================================
    // Failure and retry
    // ========================================================================

    async fn fail(self: &Arc<Self>, reason: String) {
        error!(server = %self.name(), "{reason}");
        *self.last_error.write().await = Some(reason.clone());
        self.emit(SessionEvent::Log {
            level: LogLevel::Error,
            message: reason,
        });
        self.set_state(ConnectionState::Failed).await;
        if self.config.auto_retry {
            self.schedule_retry();
        }
    }

    /// Arm the retry timer. Returns false when one is already pending.
    fn schedule_retry(self: &Arc<Self>) -> bool {
        if self
            .retry_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let delay_secs = self.config.retry_delay_secs;
        self.emit_log(LogLevel::Info, format!("Retrying in {delay_secs}s"));

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            let Some(session) = weak.upgrade() else { return };
            session.retry_scheduled.store(false, Ordering::SeqCst);
            if !session.alive.load(Ordering::SeqCst) {
                return;
            }
            if session.state().await == ConnectionState::Failed {
                info!(server = %session.name(), "Auto-retrying");
                let _ = session.connect().await;
            }
        });
        true
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    async fn spawn_monitor(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut slot = self.monitor.lock().await;
            if let Some(old) = slot.take() {
                old.cancel();
            }
            *slot = Some(token.clone());
        }
        self.spawn_event_listener(token.clone());
        if self.config.auto_reconnect {
            self.spawn_health_monitor(token);
        }
    }

    fn spawn_event_listener(self: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        let mut rx = self.connector.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => return,
                    event = rx.recv() => event,
                };
                let Some(session) = weak.upgrade() else { return };
                if !session.alive.load(Ordering::SeqCst) {
                    return;
                }
                match event {
                    Ok(TransportEvent::Notification(n)) => session.handle_notification(n),
                    Ok(TransportEvent::Closed) => {
                        session.handle_transport_closed().await;
                        return;
                    }
                    Ok(TransportEvent::Request(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(server = %session.name(), skipped, "Session event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn spawn_health_monitor(self: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        let threshold = Duration::from_secs(self.config.health_check_timeout_secs);
        tokio::spawn(async move {
            let mut last_success = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(session) = weak.upgrade() else { return };
                if !session.alive.load(Ordering::SeqCst) {
                    return;
                }
                if session.state().await != ConnectionState::Ready {
                    continue;
                }

                match session.connector.ping().await {
                    Ok(()) => last_success = tokio::time::Instant::now(),
                    Err(e) => {
                        debug!(server = %session.name(), error = %e, "Health check failed");
                    }
                }
                if token.is_cancelled() {
                    return;
                }

                if last_success.elapsed() > threshold {
                    session.emit_log(
                        LogLevel::Warn,
                        format!("{} is unresponsive, reconnecting", session.name()),
                    );
                    session.set_state(ConnectionState::Discovering).await;
                    let delay = Duration::from_secs(session.config.retry_delay_secs);
                    let weak = Arc::downgrade(&session);
                    drop(session);

                    tokio::time::sleep(delay).await;
                    if token.is_cancelled() {
                        return;
                    }
                    if let Some(session) = weak.upgrade() {
                        if session.alive.load(Ordering::SeqCst) {
                            let _ = session.connect().await;
                        }
                    }
                    return;
                }
            }
        });
    }

    fn handle_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/tools/list_changed" => {
                let session = Arc::clone(self);
                tokio::spawn(async move { session.refresh_tools_cache().await });
            }
            "notifications/resources/list_changed" => {
                let session = Arc::clone(self);
                tokio::spawn(async move { session.refresh_resources_cache().await });
            }
            "notifications/prompts/list_changed" => {
                let session = Arc::clone(self);
                tokio::spawn(async move { session.refresh_prompts_cache().await });
            }
            // Progress belongs to whichever tool call carries the token.
            "notifications/progress" => {}
            other => debug!(server = %self.name(), method = other, "Unhandled notification"),
        }
    }

    async fn handle_transport_closed(self: &Arc<Self>) {
        let state = self.state().await;
        if !(self.config.auto_reconnect && state == ConnectionState::Ready) {
            debug!(server = %self.name(), %state, "Transport closed, not reconnecting");
            return;
        }
        self.emit_log(
            LogLevel::Warn,
            format!("Connection to {} lost, reconnecting", self.name()),
        );
        self.set_state(ConnectionState::Discovering).await;

        tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
        if self.alive.load(Ordering::SeqCst)
            && self.state().await == ConnectionState::Discovering
        {
            let _ = self.connect().await;
        }
    }

    async fn refresh_tools_cache(self: Arc<Self>) {
        let _serial = self.tools_refresh.lock().await;
        if !self.alive.load(Ordering::SeqCst) || self.state().await != ConnectionState::Ready {
            return;
        }
        match self.connector.refresh_tools().await {
            Ok(tools) => {
                self.emit(SessionEvent::ToolsChanged);
                self.emit_log(LogLevel::Info, format!("Tool list updated ({} tools)", tools.len()));
            }
            Err(e) => warn!(server = %self.name(), error = %e, "Tool refresh failed"),
        }
    }

    async fn refresh_resources_cache(self: Arc<Self>) {
        let _serial = self.resources_refresh.lock().await;
        if !self.alive.load(Ordering::SeqCst) || self.state().await != ConnectionState::Ready {
            return;
        }
        let refreshed = self.connector.refresh_resources().await;
        let templates = self.connector.refresh_resource_templates().await;
        match (refreshed, templates) {
            (Ok(_), Ok(_)) => self.emit(SessionEvent::ResourcesChanged),
            (Err(e), _) | (_, Err(e)) => {
                warn!(server = %self.name(), error = %e, "Resource refresh failed");
            }
        }
    }

    async fn refresh_prompts_cache(self: Arc<Self>) {
        let _serial = self.prompts_refresh.lock().await;
        if !self.alive.load(Ordering::SeqCst) || self.state().await != ConnectionState::Ready {
            return;
        }
        match self.connector.refresh_prompts().await {
            Ok(_) => self.emit(SessionEvent::PromptsChanged),
            Err(e) => warn!(server = %self.name(), error = %e, "Prompt refresh failed"),
        }
    }

    // ========================================================================
    // Operations (Ready only)
    // ========================================================================

    async fn ensure_ready(&self) -> ClientResult<()> {
        if self.state().await != ConnectionState::Ready {
            return Err(ClientError::NotConnected(self.name().to_string()));
        }
        Ok(())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<ToolCallResult> {
        self.ensure_ready().await?;
        self.connector.call_tool(name, arguments).await
    }

    pub async fn list_resources(&self) -> ClientResult<Vec<McpResource>> {
        self.ensure_ready().await?;
        self.connector.list_resources().await
    }

    pub async fn list_resource_templates(&self) -> ClientResult<Vec<ResourceTemplate>> {
        self.ensure_ready().await?;
        self.connector.list_resource_templates().await
    }

    pub async fn read_resource(&self, uri: &str) -> ClientResult<ReadResourceResult> {
        self.ensure_ready().await?;
        self.connector.read_resource(uri).await
    }

    pub async fn list_prompts(&self) -> ClientResult<Vec<McpPrompt>> {
        self.ensure_ready().await?;
        self.connector.list_prompts().await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<GetPromptResult> {
        self.ensure_ready().await?;
        self.connector.get_prompt(name, arguments).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == next {
                return;
            }
            debug!(server = %self.name(), from = %state, to = %next, "State change");
            *state = next;
        }
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => debug!(server = %self.name(), "{message}"),
            LogLevel::Info => info!(server = %self.name(), "{message}"),
            LogLevel::Warn => warn!(server = %self.name(), "{message}"),
            LogLevel::Error => error!(server = %self.name(), "{message}"),
        }
        self.emit(SessionEvent::Log { level, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock_auth::MockAuthenticator;
    use crate::connector::{ConnectorConfig, TransportPreference};
    use crate::transport::mock::{Canned, MockFactory, MockTransport};
    use crate::transport::{TransportError, TransportFactory, TransportKind};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            retry_delay_secs: 0,
            reauth_delay_ms: 10,
            auth_timeout_secs: 5,
            health_check_interval_secs: 1,
            health_check_timeout_secs: 2,
            ..SessionConfig::default()
        }
    }

    async fn factory_with(transports: Vec<Arc<MockTransport>>) -> Arc<MockFactory> {
        let factory = Arc::new(MockFactory::new());
        for t in transports {
            factory.push(t).await;
        }
        factory
    }

    fn session_with(
        factory: Arc<MockFactory>,
        auth: Option<Arc<dyn Authenticator>>,
        config: SessionConfig,
    ) -> Arc<McpSession> {
        let connector_config = ConnectorConfig::new("test", "http://localhost:1234/mcp")
            .with_transport(TransportPreference::StreamableHttp);
        let connector = Arc::new(Connector::new(
            connector_config,
            factory as Arc<dyn TransportFactory>,
            auth,
        ));
        Arc::new(McpSession::new(connector, config))
    }

    async fn wait_for_state(session: &Arc<McpSession>, target: ConnectionState) {
        for _ in 0..200 {
            if session.state().await == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {target:?}, still {:?}",
            session.state().await
        );
    }

    fn drain_states(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged(s) = event {
                states.push(s);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_connect_walks_the_states_to_ready() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        let session = session_with(factory_with(vec![mock]).await, None, fast_config());
        let mut rx = session.subscribe();

        session.connect().await.unwrap();

        assert_eq!(session.state().await, ConnectionState::Ready);
        let states = drain_states(&mut rx);
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Loading,
                ConnectionState::Ready,
            ]
        );
        assert!(session.error().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_sets_failed() {
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Transport(TransportError::Status {
                status: 500,
                message: "Internal Server Error".to_string(),
            }),
        )
        .await;
        let session = session_with(factory_with(vec![mock]).await, None, fast_config());

        session.connect().await.unwrap_err();

        assert_eq!(session.state().await, ConnectionState::Failed);
        assert!(session.error().await.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_concurrent_connects_collapse() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        mock.set_request_delay(Duration::from_millis(50)).await;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );

        let a = Arc::clone(&session);
        let b = Arc::clone(&session);
        let (ra, rb) = tokio::join!(
            async move { a.connect().await },
            async move { b.connect().await }
        );
        ra.unwrap();
        rb.unwrap();
        wait_for_state(&session, ConnectionState::Ready).await;

        assert_eq!(mock.requests_for("initialize").await.len(), 1);
    }

    #[tokio::test]
    async fn test_operations_gated_on_ready() {
        let session = session_with(factory_with(vec![]).await, None, fast_config());

        let err = session.call_tool("x", None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
        let err = session.list_resources().await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_auth_branch_nothing_configured() {
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Transport(TransportError::Status {
                status: 401,
                message: "Unauthorized".to_string(),
            }),
        )
        .await;
        let session = session_with(factory_with(vec![mock]).await, None, fast_config());

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, ClientError::AuthRequired(_)));
        assert!(err.to_string().contains("add an Authorization header"));
        assert_eq!(session.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_auth_branch_custom_headers_rejected() {
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Transport(TransportError::Status {
                status: 401,
                message: "Unauthorized".to_string(),
            }),
        )
        .await;
        let connector_config = ConnectorConfig::new("test", "http://localhost:1234/mcp")
            .with_transport(TransportPreference::StreamableHttp)
            .with_header("Authorization", "Bearer stale-key");
        let connector = Arc::new(Connector::new(
            connector_config,
            factory_with(vec![mock]).await as Arc<dyn TransportFactory>,
            None,
        ));
        let session = Arc::new(McpSession::new(connector, fast_config()));

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, ClientError::CredentialsRejected(_)));
        assert!(err.to_string().contains("credentials were rejected"));
        assert!(!err.to_string().contains("OAuth"));
    }

    #[tokio::test]
    async fn test_auth_branch_provider_runs_flow_to_ready() {
        let rejected = MockTransport::new(TransportKind::StreamableHttp);
        rejected
            .script(
                "initialize",
                Canned::Transport(TransportError::Status {
                    status: 401,
                    message: "Unauthorized".to_string(),
                }),
            )
            .await;
        let accepted = MockTransport::ready(TransportKind::StreamableHttp).await;
        let factory = factory_with(vec![rejected, Arc::clone(&accepted)]).await;

        let auth = MockAuthenticator::new();
        *auth.token_after_authorize.lock().await = Some("fresh".to_string());
        auth.authorize_delay_ms.store(150, Ordering::SeqCst);

        let session = session_with(
            factory,
            Some(Arc::clone(&auth) as Arc<dyn Authenticator>),
            fast_config(),
        );
        let mut rx = session.subscribe();

        // The attempt parks in the auth flow rather than failing.
        session.connect().await.unwrap();
        assert_eq!(session.state().await, ConnectionState::Authenticating);

        wait_for_state(&session, ConnectionState::Ready).await;
        assert_eq!(auth.authorize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.auth_url().await, None);

        let mut saw_url = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::AuthUrl(url) => {
                    assert!(url.contains("authorize"));
                    saw_url = true;
                }
                SessionEvent::AuthCompleted { success: true, .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_url, "auth URL should surface while the flow is pending");
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_auth_failure_reaches_failed() {
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Transport(TransportError::Status {
                status: 401,
                message: "Unauthorized".to_string(),
            }),
        )
        .await;
        let auth = MockAuthenticator::new();
        *auth.deny_with.lock().await = Some("user said no".to_string());

        let session = session_with(
            factory_with(vec![mock]).await,
            Some(auth as Arc<dyn Authenticator>),
            fast_config(),
        );

        session.connect().await.unwrap();
        wait_for_state(&session, ConnectionState::Failed).await;
        assert!(session
            .error()
            .await
            .unwrap()
            .contains("Authorization failed"));
    }

    #[tokio::test]
    async fn test_authorization_loop_detected() {
        // Every attempt gets 401 even though authorize keeps succeeding.
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Transport(TransportError::Status {
                status: 401,
                message: "Unauthorized".to_string(),
            }),
        )
        .await;
        let auth = MockAuthenticator::new();
        *auth.token_after_authorize.lock().await = Some("always-rejected".to_string());

        let session = session_with(
            factory_with(vec![mock]).await,
            Some(Arc::clone(&auth) as Arc<dyn Authenticator>),
            fast_config(),
        );

        session.connect().await.unwrap();
        wait_for_state(&session, ConnectionState::Failed).await;

        assert!(session.error().await.unwrap().contains("loop"));
        // Two rounds ran; the third was refused.
        assert_eq!(auth.authorize_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_timer_armed_once() {
        let session = session_with(factory_with(vec![]).await, None, fast_config());

        assert!(session.schedule_retry());
        assert!(!session.schedule_retry());
    }

    #[tokio::test]
    async fn test_auto_retry_recovers() {
        // First handshake fails, the retry succeeds.
        let failing_first = MockTransport::new(TransportKind::StreamableHttp);
        failing_first
            .script(
                "initialize",
                Canned::Transport(TransportError::Status {
                    status: 500,
                    message: "warming up".to_string(),
                }),
            )
            .await;
        failing_first
            .script(
                "initialize",
                Canned::Result(serde_json::json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "0.1"},
                })),
            )
            .await;
        failing_first
            .script("tools/list", Canned::Result(serde_json::json!({"tools": []})))
            .await;
        failing_first
            .script("ping", Canned::Result(serde_json::json!({})))
            .await;

        let mut config = fast_config();
        config.auto_retry = true;
        let session = session_with(
            factory_with(vec![Arc::clone(&failing_first)]).await,
            None,
            config,
        );

        session.connect().await.unwrap_err();
        assert_eq!(session.state().await, ConnectionState::Failed);

        wait_for_state(&session, ConnectionState::Ready).await;
        assert_eq!(failing_first.requests_for("initialize").await.len(), 2);
    }

    #[tokio::test]
    async fn test_manual_retry_from_failed() {
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Transport(TransportError::Network("refused".to_string())),
        )
        .await;
        mock.script(
            "initialize",
            Canned::Result(serde_json::json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "serverInfo": {"name": "mock", "version": "0.1"},
            })),
        )
        .await;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );

        session.connect().await.unwrap_err();
        assert_eq!(session.state().await, ConnectionState::Failed);

        session.retry().await.unwrap();
        assert_eq!(session.state().await, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_transport_close_reconnects_from_ready() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );
        session.connect().await.unwrap();

        mock.emit(TransportEvent::Closed);
        // Reconnect is immediate with a zero retry delay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        wait_for_state(&session, ConnectionState::Ready).await;

        assert_eq!(mock.requests_for("initialize").await.len(), 2);
    }

    #[tokio::test]
    async fn test_transport_close_ignored_without_auto_reconnect() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        let mut config = fast_config();
        config.auto_reconnect = false;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            config,
        );
        session.connect().await.unwrap();

        mock.emit(TransportEvent::Closed);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(mock.requests_for("initialize").await.len(), 1);
        assert_eq!(session.state().await, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_tools_list_changed_refreshes_cache() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        mock.script(
            "tools/list",
            Canned::Result(serde_json::json!({"tools": [{"name": "late-arrival"}]})),
        )
        .await;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );
        session.connect().await.unwrap();
        assert!(session.tools().await.is_empty());

        let mut rx = session.subscribe();
        mock.emit(TransportEvent::Notification(JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        )));

        for _ in 0..100 {
            if session.tools().await.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.tools().await[0].name, "late-arrival");

        let mut saw_change = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::ToolsChanged) {
                saw_change = true;
            }
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_tools() {
        let mock = MockTransport::new(TransportKind::StreamableHttp);
        mock.script(
            "initialize",
            Canned::Result(serde_json::json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mock", "version": "0.1"},
            })),
        )
        .await;
        mock.script(
            "tools/list",
            Canned::Result(serde_json::json!({"tools": [{"name": "search"}]})),
        )
        .await;
        mock.script(
            "tools/list",
            Canned::Transport(TransportError::Network("reset".to_string())),
        )
        .await;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );
        session.connect().await.unwrap();
        assert_eq!(session.tools().await.len(), 1);

        mock.emit(TransportEvent::Notification(JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        )));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Still the connect-time snapshot.
        assert_eq!(session.tools().await[0].name, "search");
        assert_eq!(session.state().await, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_manual_authenticate_starts_flow() {
        let auth = MockAuthenticator::new();
        let session = session_with(
            factory_with(vec![]).await,
            Some(Arc::clone(&auth) as Arc<dyn Authenticator>),
            fast_config(),
        );

        session.authenticate().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(auth.authorize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_authenticate_without_provider_errors() {
        let session = session_with(factory_with(vec![]).await, None, fast_config());
        let err = session.authenticate().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthRequired(_)));
    }

    #[tokio::test]
    async fn test_clear_storage_delegates_to_provider() {
        let auth = MockAuthenticator::with_token("t").await;
        let session = session_with(
            factory_with(vec![]).await,
            Some(Arc::clone(&auth) as Arc<dyn Authenticator>),
            fast_config(),
        );

        let removed = session.clear_storage().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(auth.clear_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_goes_idle() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );
        session.connect().await.unwrap();

        let failed_steps = session.disconnect().await;
        assert_eq!(failed_steps, 0);
        assert_eq!(session.state().await, ConnectionState::Discovering);
        assert!(mock.closed.load(Ordering::SeqCst));

        let err = session.call_tool("x", None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_declares_dead_server() {
        let mock = MockTransport::ready(TransportKind::StreamableHttp).await;
        mock.script(
            "ping",
            Canned::Transport(TransportError::Network("down".to_string())),
        )
        .await;
        // First ping succeeds (the ready() queue), every later ping fails.
        let session = session_with(
            factory_with(vec![Arc::clone(&mock)]).await,
            None,
            fast_config(),
        );
        session.connect().await.unwrap();

        // Interval 1s, threshold 2s: the monitor declares the server dead
        // once pings have failed for longer than the threshold.
        for _ in 0..120 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if mock.requests_for("initialize").await.len() >= 2 {
                break;
            }
        }
        assert!(
            mock.requests_for("initialize").await.len() >= 2,
            "health monitor should have forced a reconnect"
        );
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Discovering.to_string(), "discovering");
        assert_eq!(ConnectionState::PendingAuth.to_string(), "pending_auth");
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }
}
