//! Shared fixtures for adapter and bridge tests.

use mcplink_client::{
    Connector, ConnectorConfig, HttpTransportFactory, McpSession, SessionConfig,
    TransportPreference,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A session that was never connected. Calls on it fail fast.
pub(crate) fn idle_session(name: &str) -> Arc<McpSession> {
    session_for(name, "http://127.0.0.1:1/mcp")
}

fn session_for(name: &str, url: &str) -> Arc<McpSession> {
    let config = ConnectorConfig::new(name, url)
        .with_transport(TransportPreference::StreamableHttp);
    let factory = Arc::new(HttpTransportFactory::new(url, HashMap::new(), 30));
    let connector = Arc::new(Connector::new(config, factory, None));
    Arc::new(McpSession::new(connector, SessionConfig::default()))
}

/// Mock server answering the handshake: one `echo` tool, nothing else.
pub(crate) async fn handshake_server() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "fixture", "version": "1.0"}
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": [{"name": "echo", "description": "say it back"}]}
        })))
        .mount(&server)
        .await;

    server
}

/// A connected session against the fixture server.
pub(crate) async fn ready_session(server: &MockServer, name: &str) -> Arc<McpSession> {
    let session = session_for(name, &format!("{}/mcp", server.uri()));
    session.connect().await.expect("fixture handshake failed");
    session
}
