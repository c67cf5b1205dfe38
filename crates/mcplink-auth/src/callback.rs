//! Loopback HTTP server for OAuth authorization callbacks.
//!
//! The server accepts redirects on `127.0.0.1` only. Each in-flight
//! authorization registers its `state` parameter; a callback carrying an
//! unknown state is rejected and never forwarded.

use crate::error::{AuthError, AuthResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Default port for the loopback callback server.
pub const DEFAULT_CALLBACK_PORT: u16 = 18912;

/// Path the authorization server redirects back to.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// How long to wait for the user to complete authorization.
pub const CALLBACK_TIMEOUT_SECS: u64 = 300;

const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head><title>Authorization Complete</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4em;">
<h1>Authorization complete</h1>
<p>You can close this window and return to the terminal.</p>
<script>setTimeout(function() { window.close(); }, 1000);</script>
</body>
</html>"#;

fn html_error(reason: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authorization Failed</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4em;">
<h1>Authorization failed</h1>
<p>{}</p>
</body>
</html>"#,
        html_escape(reason)
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

struct PendingAuth {
    sender: oneshot::Sender<AuthResult<String>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingAuth>>>;

/// Loopback server that receives authorization redirects.
pub struct CallbackServer {
    addr: SocketAddr,
    pending: PendingMap,
    accept_task: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Bind the server on `127.0.0.1:port` and start accepting connections.
    ///
    /// Pass port `0` to bind an ephemeral port.
    pub async fn bind(port: u16) -> AuthResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::Callback(format!("cannot bind 127.0.0.1:{port}: {e}")))?;
        let addr = listener.local_addr()?;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, pending.clone()));
        debug!(addr = %addr, "OAuth callback server listening");
        Ok(Self {
            addr,
            pending,
            accept_task,
        })
    }

    /// The redirect URI to advertise to the authorization server.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, CALLBACK_PATH)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait for the callback carrying `state`, up to `timeout_secs`.
    ///
    /// Returns the authorization code on success.
    pub async fn wait_for_callback(&self, state: &str, timeout_secs: u64) -> AuthResult<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(state.to_string(), PendingAuth { sender: tx });
        }

        match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(state);
                Err(AuthError::Timeout(timeout_secs))
            }
        }
    }

    /// Cancel an in-flight wait for `state`.
    pub async fn cancel_pending(&self, state: &str) {
        if let Some(p) = self.pending.lock().await.remove(state) {
            let _ = p.sender.send(Err(AuthError::Cancelled));
        }
    }

    /// Stop accepting connections and cancel all pending waits.
    pub async fn stop(self) {
        self.accept_task.abort();
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.sender.send(Err(AuthError::Cancelled));
        }
    }
}

async fn accept_loop(listener: TcpListener, pending: PendingMap) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let pending = pending.clone();
                tokio::spawn(async move {
                    handle_connection(stream, pending).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "OAuth callback accept failed");
                break;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, pending: PendingMap) {
    let mut buf = [0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let Some(request_line) = request.lines().next() else {
        return;
    };

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    if method != "GET" || path != CALLBACK_PATH {
        let _ = stream
            .write_all(http_response("404 Not Found", "text/plain", "Not Found").as_bytes())
            .await;
        return;
    }

    let params = parse_query(query);

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .cloned()
            .unwrap_or_else(|| error.clone());
        if let Some(state) = params.get("state") {
            if let Some(p) = pending.lock().await.remove(state) {
                let _ = p.sender.send(Err(AuthError::Denied(description.clone())));
            }
        }
        let _ = stream
            .write_all(
                http_response("200 OK", "text/html", &html_error(&description)).as_bytes(),
            )
            .await;
        return;
    }

    let (Some(code), Some(state)) = (params.get("code"), params.get("state")) else {
        let _ = stream
            .write_all(
                http_response(
                    "400 Bad Request",
                    "text/html",
                    &html_error("Missing code or state parameter"),
                )
                .as_bytes(),
            )
            .await;
        return;
    };

    let Some(p) = pending.lock().await.remove(state) else {
        // Unknown state: not one of ours, or already handled. Do not forward.
        warn!("OAuth callback carried an unknown state parameter, rejecting");
        let _ = stream
            .write_all(
                http_response(
                    "400 Bad Request",
                    "text/html",
                    &html_error("Unknown or expired authorization state"),
                )
                .as_bytes(),
            )
            .await;
        return;
    };

    let _ = p.sender.send(Ok(code.clone()));
    let _ = stream
        .write_all(http_response("200 OK", "text/html", HTML_SUCCESS).as_bytes())
        .await;
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = urlencoding::decode(value).ok()?;
            Some((key.to_string(), value.into_owned()))
        })
        .collect()
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}
