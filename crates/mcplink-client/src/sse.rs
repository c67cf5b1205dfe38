//! Legacy HTTP+SSE transport (protocol revision 2024-11-05).
//!
//! The client opens a long-lived GET stream; the server's first event is
//! `endpoint`, naming the URL to POST messages to. Responses do not come
//! back on the POST (which answers 202 Accepted) but on the stream, so
//! requests are correlated with their responses through a pending map
//! keyed by request id.

use crate::http::{apply_headers, map_reqwest_error, read_error_body, HttpConfig};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{SseParser, Transport, TransportError, TransportEvent, TransportKind};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, warn};

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

pub struct SseTransport {
    config: HttpConfig,
    http: reqwest::Client,
    endpoint: RwLock<Option<String>>,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<TransportEvent>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    /// Set before the pending map is drained, so a request registered after
    /// the drain can tell the stream is gone instead of waiting forever.
    stream_dead: Arc<AtomicBool>,
}

impl SseTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config,
            http,
            endpoint: RwLock::new(None),
            pending: Arc::new(PendingMap::default()),
            events,
            reader: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            stream_dead: Arc::new(AtomicBool::new(false)),
        })
    }

    /// POST one message to the resolved endpoint. The server acknowledges
    /// with 202 Accepted; the actual response, if any, arrives on the
    /// event stream.
    async fn post_to_endpoint(&self, body: &Value) -> Result<(), TransportError> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or(TransportError::Closed)?;

        let mut builder = self
            .http
            .post(&endpoint)
            .header("Content-Type", "application/json");
        builder = apply_headers(builder, &self.config.headers, self.config.bearer.as_deref());

        let send = builder.json(body).send();
        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), send)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = read_error_body(response, status).await;
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        if status.as_u16() != 202 {
            debug!(status = status.as_u16(), "Expected 202 Accepted");
        }
        Ok(())
    }
}

/// Route one stream message: responses complete their pending request,
/// everything else is forwarded to subscribers.
async fn dispatch_message(
    pending: &PendingMap,
    events: &broadcast::Sender<TransportEvent>,
    data: &str,
) {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable stream message");
            return;
        }
    };

    if value.get("result").is_some() || value.get("error").is_some() {
        let response: JsonRpcResponse = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed response");
                return;
            }
        };
        match pending.lock().await.remove(&response.id) {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("Requester gave up before the response arrived");
                }
            }
            None => debug!(id = response.id, "Response for unknown request id"),
        }
        return;
    }

    if value.get("method").is_none() {
        debug!("Ignoring message with no method");
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

/// A dead stream means every outstanding request is dead too.
async fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    if !drained.is_empty() {
        debug!(count = drained.len(), "Dropping requests pending on a closed stream");
    }
}

fn resolve_endpoint(base: &str, endpoint: &str) -> Result<String, TransportError> {
    let base = url::Url::parse(base)
        .map_err(|e| TransportError::InvalidResponse(format!("bad base URL: {e}")))?;
    let resolved = base
        .join(endpoint)
        .map_err(|e| TransportError::InvalidResponse(format!("bad endpoint: {e}")))?;
    Ok(resolved.to_string())
}

#[async_trait]
impl Transport for SseTransport {
    /// Open the event stream and wait for the server to name its message
    /// endpoint. No messages can be sent before this completes.
    async fn connect(&self) -> Result<(), TransportError> {
        let mut builder = self
            .http
            .get(&self.config.url)
            .header("Accept", "text/event-stream");
        builder = apply_headers(builder, &self.config.headers, self.config.bearer.as_deref());

        let response = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            builder.send(),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = read_error_body(response, status).await;
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();

        let endpoint = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            async {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(map_reqwest_error)?;
                    let text = String::from_utf8_lossy(&chunk);
                    for event in parser.feed(&text) {
                        if event.event == "endpoint" {
                            return Ok(event.data);
                        }
                        if event.event == "message" {
                            dispatch_message(&self.pending, &self.events, &event.data).await;
                        }
                    }
                }
                Err(TransportError::Closed)
            },
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let endpoint = resolve_endpoint(&self.config.url, &endpoint)?;
        debug!(endpoint = %endpoint, "Message endpoint resolved");
        *self.endpoint.write().await = Some(endpoint);

        // Keep reading: responses, server requests and notifications all
        // arrive on this stream.
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let closing = Arc::clone(&self.closing);
        let stream_dead = Arc::clone(&self.stream_dead);
        let handle = tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        if !closing.load(Ordering::SeqCst) {
                            warn!(error = %e, "Event stream failed");
                        }
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.feed(&text) {
                    if event.event == "message" {
                        dispatch_message(&pending, &events, &event.data).await;
                    }
                }
            }
            stream_dead.store(true, Ordering::SeqCst);
            fail_pending(&pending).await;
            if !closing.load(Ordering::SeqCst) {
                debug!("Event stream ended");
                let _ = events.send(TransportEvent::Closed);
            }
        });
        *self.reader.lock().await = Some(handle);

        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let id = request
            .id
            .ok_or_else(|| TransportError::InvalidResponse("request without an id".to_string()))?;
        let body = serde_json::to_value(&request)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.post_to_endpoint(&body).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        if self.stream_dead.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }

        // No deadline here: callers own request deadlines, and the pending
        // entry is dropped with the stream if it dies.
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        let body = serde_json::to_value(&notification)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        self.post_to_endpoint(&body).await
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), TransportError> {
        let body = serde_json::to_value(&response)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        self.post_to_endpoint(&body).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Legacy SSE carries session identity inside the endpoint URL, not in
    /// a header.
    async fn session_id(&self) -> Option<String> {
        None
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        self.stream_dead.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        fail_pending(&self.pending).await;
        *self.endpoint.write().await = None;
        Ok(())
    }
}
