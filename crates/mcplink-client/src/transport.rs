//! Transport abstraction for MCP connections.
//!
//! Transports move JSON-RPC messages and surface raw failures; deciding what
//! a failure means (authenticate, fall back, give up) happens here in
//! [`classify`] so the rules live in one place instead of scattered string
//! matching.

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Header carrying the server-assigned session id (streamable HTTP).
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Header carrying the negotiated protocol version (streamable HTTP).
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Transport-level errors.
///
/// These carry the raw status and text; interpretation is [`classify`]'s
/// job, not the transport's.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Non-success HTTP status.
    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection-level failure with no HTTP status.
    #[error("Network error: {0}")]
    Network(String),

    /// The server sent something that does not parse.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The transport is closed.
    #[error("Transport closed")]
    Closed,

    /// No response arrived in time.
    #[error("Request timed out")]
    Timeout,
}

impl TransportError {
    /// Classify this error for connect-time policy decisions.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Status { status, message } => classify(Some(*status), message),
            Self::Network(message) => classify(None, message),
            Self::InvalidResponse(_) | Self::Closed | Self::Timeout => ErrorClass::Fatal,
        }
    }
}

/// What a transport failure means for the connect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The server wants credentials. Never triggers transport fallback:
    /// the other transport would be rejected identically.
    AuthRequired,
    /// Worth attempting the other transport.
    Fallback(FallbackReason),
    /// Hard failure, no recovery at this layer.
    Fatal,
}

/// Why an error is fallback-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// HTTP 400 carrying a known "missing session id" marker. Servers built
    /// on FastMCP answer streamable-HTTP posts this way when they only
    /// speak the legacy SSE protocol.
    MissingSessionId,
    /// HTTP 405: the endpoint does not accept this verb.
    MethodNotAllowed,
    /// HTTP 404: no streamable endpoint at this path.
    NotFound,
    /// Network-level failure with no status, indistinguishable from CORS.
    NetworkOrCors,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSessionId => write!(f, "missing session id"),
            Self::MethodNotAllowed => write!(f, "method not allowed"),
            Self::NotFound => write!(f, "not found"),
            Self::NetworkOrCors => write!(f, "network or CORS failure"),
        }
    }
}

/// Known quirk markers, matched case-insensitively against error text.
///
/// These are fixtures, not heuristics: each entry reproduces a string an
/// actual server implementation returns. Extend the table only for quirks
/// observed in the wild, and cover every entry in the classification tests.
pub const MISSING_SESSION_MARKERS: &[&str] = &["missing session id"];

/// Markers for method-not-allowed when the status got swallowed upstream.
pub const METHOD_NOT_ALLOWED_MARKERS: &[&str] = &["method not allowed"];

/// Markers for authentication demands without a structured 401.
pub const UNAUTHORIZED_MARKERS: &[&str] = &["unauthorized"];

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| haystack.contains(m))
}

/// Classify a transport failure from its status code and message text.
///
/// 401 short-circuits everything else: falling back on an auth demand would
/// just trigger a second prompt. 404/405 and a 400 carrying a known
/// missing-session marker mean the server likely speaks the other transport.
/// A status-less network failure is treated as fallback-eligible because a
/// CORS rejection is indistinguishable from one.
pub fn classify(status: Option<u16>, message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    match status {
        Some(401) => ErrorClass::AuthRequired,
        Some(400) if contains_any(&lower, MISSING_SESSION_MARKERS) => {
            ErrorClass::Fallback(FallbackReason::MissingSessionId)
        }
        Some(404) => ErrorClass::Fallback(FallbackReason::NotFound),
        Some(405) => ErrorClass::Fallback(FallbackReason::MethodNotAllowed),
        Some(_) => ErrorClass::Fatal,
        None => {
            if contains_any(&lower, UNAUTHORIZED_MARKERS) {
                ErrorClass::AuthRequired
            } else if contains_any(&lower, MISSING_SESSION_MARKERS) {
                ErrorClass::Fallback(FallbackReason::MissingSessionId)
            } else if contains_any(&lower, METHOD_NOT_ALLOWED_MARKERS) {
                ErrorClass::Fallback(FallbackReason::MethodNotAllowed)
            } else {
                ErrorClass::Fallback(FallbackReason::NetworkOrCors)
            }
        }
    }
}

/// Which wire variant a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Streamable HTTP (2025-03-26).
    StreamableHttp,
    /// Legacy HTTP+SSE (2024-11-05).
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamableHttp => write!(f, "streamable-http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Server-initiated traffic and lifecycle events.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Notification pushed by the server.
    Notification(JsonRpcNotification),
    /// Request from the server that expects a [`Transport::respond`].
    Request(JsonRpcRequest),
    /// The transport closed without [`Transport::close`] being called.
    Closed,
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the transport. For SSE this establishes the event stream and
    /// resolves the message endpoint; for streamable HTTP it is cheap.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send a request and wait for its response.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError>;

    /// Answer a server-to-client request.
    async fn respond(&self, response: JsonRpcResponse) -> Result<(), TransportError>;

    /// Subscribe to server-initiated traffic.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Session identifier assigned by the server, when one exists.
    async fn session_id(&self) -> Option<String>;

    /// Which wire variant this is.
    fn kind(&self) -> TransportKind;

    /// Close the transport.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds transports for the connector, one per connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(
        &self,
        kind: TransportKind,
        bearer: Option<String>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Factory for the real HTTP transports.
pub struct HttpTransportFactory {
    url: String,
    headers: HashMap<String, String>,
    timeout_secs: u64,
}

impl HttpTransportFactory {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            headers,
            timeout_secs,
        }
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    async fn build(
        &self,
        kind: TransportKind,
        bearer: Option<String>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let config = crate::http::HttpConfig {
            url: self.url.clone(),
            headers: self.headers.clone(),
            bearer,
            timeout_secs: self.timeout_secs,
        };
        match kind {
            TransportKind::StreamableHttp => Ok(Arc::new(
                crate::http::StreamableHttpTransport::new(config)?,
            )),
            TransportKind::Sse => Ok(Arc::new(crate::sse::SseTransport::new(config)?)),
        }
    }
}

// ============================================================================
// SSE wire parsing (shared by both transports)
// ============================================================================

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser. Feed raw chunks, get complete events back.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = parse_event_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim_start_matches(' ').to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_401_is_auth_not_fallback() {
        assert_eq!(classify(Some(401), "Unauthorized"), ErrorClass::AuthRequired);
        assert_eq!(classify(None, "401 Unauthorized"), ErrorClass::AuthRequired);
    }

    #[test]
    fn test_classify_every_missing_session_marker() {
        for marker in MISSING_SESSION_MARKERS {
            assert_eq!(
                classify(Some(400), marker),
                ErrorClass::Fallback(FallbackReason::MissingSessionId),
                "marker {marker:?} must classify as missing-session fallback"
            );
            // Real servers vary the casing.
            assert_eq!(
                classify(Some(400), &marker.to_uppercase()),
                ErrorClass::Fallback(FallbackReason::MissingSessionId)
            );
        }
    }

    #[test]
    fn test_classify_fastmcp_body() {
        assert_eq!(
            classify(Some(400), "Bad Request: Missing session ID"),
            ErrorClass::Fallback(FallbackReason::MissingSessionId)
        );
    }

    #[test]
    fn test_classify_400_without_marker_is_fatal() {
        assert_eq!(classify(Some(400), "Bad Request"), ErrorClass::Fatal);
    }

    #[test]
    fn test_classify_404_405() {
        assert_eq!(
            classify(Some(404), "Not Found"),
            ErrorClass::Fallback(FallbackReason::NotFound)
        );
        assert_eq!(
            classify(Some(405), "Method Not Allowed"),
            ErrorClass::Fallback(FallbackReason::MethodNotAllowed)
        );
    }

    #[test]
    fn test_classify_server_errors_fatal() {
        assert_eq!(classify(Some(500), "Internal Server Error"), ErrorClass::Fatal);
        assert_eq!(classify(Some(503), "overloaded"), ErrorClass::Fatal);
    }

    #[test]
    fn test_classify_statusless_network_is_fallback() {
        assert_eq!(
            classify(None, "connection refused"),
            ErrorClass::Fallback(FallbackReason::NetworkOrCors)
        );
    }

    #[test]
    fn test_classify_statusless_markers() {
        assert_eq!(
            classify(None, "Missing session ID"),
            ErrorClass::Fallback(FallbackReason::MissingSessionId)
        );
        assert_eq!(
            classify(None, "405 Method Not Allowed"),
            ErrorClass::Fallback(FallbackReason::MethodNotAllowed)
        );
    }

    #[test]
    fn test_transport_error_classify_mapping() {
        let e = TransportError::Status {
            status: 401,
            message: "no".to_string(),
        };
        assert_eq!(e.classify(), ErrorClass::AuthRequired);

        assert_eq!(
            TransportError::Network("reset".to_string()).classify(),
            ErrorClass::Fallback(FallbackReason::NetworkOrCors)
        );
        assert_eq!(
            TransportError::InvalidResponse("garbage".to_string()).classify(),
            ErrorClass::Fatal
        );
        assert_eq!(TransportError::Closed.classify(), ErrorClass::Fatal);
        assert_eq!(TransportError::Timeout.classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::StreamableHttp.to_string(), "streamable-http");
        assert_eq!(TransportKind::Sse.to_string(), "sse");
    }

    #[test]
    fn test_sse_parser_single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_sse_parser_named_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: endpoint\ndata: /messages?sid=42\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sid=42");
    }

    #[test]
    fn test_sse_parser_chunked_input() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"par").is_empty());
        assert!(parser.feed("tial\":true}").is_empty());
        let events = parser.feed("\n\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"partial\":true}");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_sse_parser_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_sse_parser_ignores_comments_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keepalive\r\n\r\nevent: message\r\ndata: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }
}
