//! Streamable HTTP transport (protocol revision 2025-03-26).
//!
//! Every message is a POST to the server URL. The server may answer a POST
//! with plain JSON or with a short-lived SSE body carrying the response;
//! both are handled here. A separate GET stream listens for
//! server-initiated traffic, and a DELETE tears the session down.

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{
    SseParser, Transport, TransportError, TransportEvent, TransportKind, PROTOCOL_VERSION_HEADER,
    SESSION_ID_HEADER,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

/// Connection establishment budget, separate from request deadlines which
/// the connector owns.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Shared configuration for the HTTP transports.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Server endpoint URL.
    pub url: String,
    /// Custom headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Bearer token, applied after custom headers so OAuth wins.
    pub bearer: Option<String>,
    /// Seconds to wait for a response to start arriving.
    pub timeout_secs: u64,
}

pub struct StreamableHttpTransport {
    config: HttpConfig,
    http: reqwest::Client,
    session: Arc<RwLock<Option<String>>>,
    protocol_version: RwLock<Option<String>>,
    events: broadcast::Sender<TransportEvent>,
    listen_started: AtomicBool,
    listen_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl StreamableHttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config,
            http,
            session: Arc::new(RwLock::new(None)),
            protocol_version: RwLock::new(None),
            events,
            listen_started: AtomicBool::new(false),
            listen_handle: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// POST one JSON-RPC message and map a non-success status to a
    /// [`TransportError::Status`] carrying the body text.
    async fn post_message(&self, body: &Value) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .http
            .post(&self.config.url)
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json");
        builder = apply_headers(builder, &self.config.headers, self.config.bearer.as_deref());

        if let Some(session) = self.session.read().await.as_deref() {
            builder = builder.header(SESSION_ID_HEADER, session);
        }
        if let Some(version) = self.protocol_version.read().await.as_deref() {
            builder = builder.header(PROTOCOL_VERSION_HEADER, version);
        }

        let send = builder.json(body).send();
        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), send)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_reqwest_error)?;

        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.write().await = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let message = read_error_body(response, status).await;
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// Extract the response to `id` from a POST reply, whichever shape the
    /// server chose. Server-initiated messages interleaved on an SSE body
    /// are forwarded to subscribers.
    async fn read_response(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, TransportError> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(map_reqwest_error)?;
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.feed(&text) {
                    if event.event != "message" {
                        continue;
                    }
                    let value: Value = serde_json::from_str(&event.data).map_err(|e| {
                        TransportError::InvalidResponse(format!("bad SSE payload: {e}"))
                    })?;
                    if value.get("result").is_some() || value.get("error").is_some() {
                        let parsed: JsonRpcResponse =
                            serde_json::from_value(value).map_err(|e| {
                                TransportError::InvalidResponse(format!("bad response: {e}"))
                            })?;
                        if parsed.id == id {
                            return Ok(parsed);
                        }
                        debug!(got = parsed.id, want = id, "Dropping response for another id");
                    } else {
                        self.forward_server_message(value);
                    }
                }
            }
            Err(TransportError::InvalidResponse(
                "stream ended before the response arrived".to_string(),
            ))
        } else {
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            serde_json::from_slice(&body)
                .map_err(|e| TransportError::InvalidResponse(format!("bad response: {e}")))
        }
    }

    fn forward_server_message(&self, value: Value) {
        if value.get("method").is_none() {
            debug!("Ignoring message with no method");
            return;
        }
        if value.get("id").is_some() {
            match serde_json::from_value::<JsonRpcRequest>(value) {
                Ok(request) => {
                    let _ = self.events.send(TransportEvent::Request(request));
                }
                Err(e) => debug!(error = %e, "Ignoring malformed server request"),
            }
        } else {
            match serde_json::from_value::<JsonRpcNotification>(value) {
                Ok(notification) => {
                    let _ = self.events.send(TransportEvent::Notification(notification));
                }
                Err(e) => debug!(error = %e, "Ignoring malformed notification"),
            }
        }
    }

    /// Open the GET listen stream for server-initiated traffic. Servers
    /// that only answer POSTs reject this with 405 or 404; that is fine.
    async fn spawn_listen_stream(&self) {
        if self.listen_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let http = self.http.clone();
        let url = self.config.url.clone();
        let headers = self.config.headers.clone();
        let bearer = self.config.bearer.clone();
        let session = self.session.read().await.clone();
        let events = self.events.clone();
        let closing = Arc::clone(&self.closing);

        let handle = tokio::spawn(async move {
            let mut builder = http.get(&url).header("Accept", "text/event-stream");
            builder = apply_headers(builder, &headers, bearer.as_deref());
            if let Some(session) = session.as_deref() {
                builder = builder.header(SESSION_ID_HEADER, session);
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "Listen stream unavailable");
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                debug!(status = status.as_u16(), "Server does not offer a listen stream");
                return;
            }

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        if !closing.load(Ordering::SeqCst) {
                            warn!(error = %e, "Listen stream failed");
                            let _ = events.send(TransportEvent::Closed);
                        }
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.feed(&text) {
                    if event.event != "message" {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&event.data) {
                        Ok(value) => forward_listen_message(&events, value),
                        Err(e) => debug!(error = %e, "Ignoring unparseable event"),
                    }
                }
            }
            if !closing.load(Ordering::SeqCst) {
                debug!("Listen stream ended");
                let _ = events.send(TransportEvent::Closed);
            }
        });
        *self.listen_handle.lock().await = Some(handle);
    }
}

fn forward_listen_message(events: &broadcast::Sender<TransportEvent>, value: Value) {
    if value.get("method").is_none() {
        return;
    }
    if value.get("id").is_some() {
        if let Ok(request) = serde_json::from_value::<JsonRpcRequest>(value) {
            let _ = events.send(TransportEvent::Request(request));
        }
    } else if let Ok(notification) = serde_json::from_value::<JsonRpcNotification>(value) {
        let _ = events.send(TransportEvent::Notification(notification));
    }
}

pub(crate) fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &HashMap<String, String>,
    bearer: Option<&str>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = e.status() {
        TransportError::Status {
            status: status.as_u16(),
            message: e.to_string(),
        }
    } else {
        TransportError::Network(e.to_string())
    }
}

pub(crate) async fn read_error_body(response: reqwest::Response, status: reqwest::StatusCode) -> String {
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body.to_string()
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        // Streamable HTTP has no separate connection phase: the first POST
        // (initialize) does the work and assigns the session.
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let id = request.id.unwrap_or(0);
        let body = serde_json::to_value(&request)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let response = self.post_message(&body).await?;
        let parsed = self.read_response(response, id).await?;

        if request.method == "initialize" {
            if let Some(version) = parsed
                .result
                .as_ref()
                .and_then(|r| r.get("protocolVersion"))
                .and_then(Value::as_str)
            {
                *self.protocol_version.write().await = Some(version.to_string());
            }
            self.spawn_listen_stream().await;
        }
        Ok(parsed)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        let body = serde_json::to_value(&notification)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        self.post_message(&body).await?;
        Ok(())
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), TransportError> {
        let body = serde_json::to_value(&response)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        self.post_message(&body).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn session_id(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listen_handle.lock().await.take() {
            handle.abort();
        }

        // Best effort: tell the server the session is over.
        let session = self.session.write().await.take();
        if let Some(session) = session {
            let mut builder = self.http.delete(&self.config.url);
            builder = apply_headers(builder, &self.config.headers, self.config.bearer.as_deref());
            builder = builder.header(SESSION_ID_HEADER, &session);
            if let Err(e) = builder.send().await {
                debug!(error = %e, "Session delete failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> HttpConfig {
        HttpConfig {
            url: url.to_string(),
            headers: HashMap::new(),
            bearer: None,
            timeout_secs: 5,
        }
    }

    fn rpc_result(id: u64, result: Value) -> Value {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
    }

    #[tokio::test]
    async fn test_request_plain_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("Accept", "application/json, text/event-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(1, serde_json::json!({"ok": true}))))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        let response = transport
            .request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_request_sse_body_response() {
        let server = MockServer::start().await;
        let body = format!(
            "event: message\ndata: {}\n\n",
            rpc_result(7, serde_json::json!({"streamed": true}))
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        let response = transport
            .request(JsonRpcRequest::new(7, "tools/call", None))
            .await
            .unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.result.unwrap()["streamed"], true);
    }

    #[tokio::test]
    async fn test_session_id_captured_and_echoed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_ID_HEADER, "sess-42")
                    .set_body_json(rpc_result(1, serde_json::json!({"protocolVersion": "2025-03-26"}))),
            )
            .mount(&server)
            .await;
        // The GET listen stream starts after initialize; reject it politely.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "ping"})))
            .and(header(SESSION_ID_HEADER, "sess-42"))
            .and(header(PROTOCOL_VERSION_HEADER, "2025-03-26"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(2, serde_json::json!({}))))
            .expect(1)
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        transport
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap();
        assert_eq!(transport.session_id().await.as_deref(), Some("sess-42"));

        transport
            .request(JsonRpcRequest::new(2, "ping", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_401_surfaces_as_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        let err = transport
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap_err();
        match &err {
            TransportError::Status { status, message } => {
                assert_eq!(*status, 401);
                assert_eq!(message, "Unauthorized");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert_eq!(err.classify(), crate::transport::ErrorClass::AuthRequired);
    }

    #[tokio::test]
    async fn test_missing_session_body_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Bad Request: Missing session ID"))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        let err = transport
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap_err();
        assert_eq!(
            err.classify(),
            crate::transport::ErrorClass::Fallback(
                crate::transport::FallbackReason::MissingSessionId
            )
        );
    }

    #[tokio::test]
    async fn test_notify_accepts_202() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_custom_headers_and_bearer_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "k123"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(1, serde_json::json!({}))))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.headers.insert("x-api-key".to_string(), "k123".to_string());
        cfg.bearer = Some("tok".to_string());
        let transport = StreamableHttpTransport::new(cfg).unwrap();
        transport
            .request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_sends_delete_with_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_ID_HEADER, "bye-1")
                    .set_body_json(rpc_result(1, serde_json::json!({}))),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header(SESSION_ID_HEADER, "bye-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(config(&server.uri())).unwrap();
        transport
            .request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.session_id().await, None);
    }
}
