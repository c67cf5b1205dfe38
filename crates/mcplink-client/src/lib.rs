//! Model Context Protocol (MCP) client.
//!
//! Connects agent applications to remote MCP servers over HTTP, handling
//! transport negotiation, OAuth, and connection lifecycle so the caller
//! only ever sees a ready session.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌───────────┐     ┌────────────┐
//! │ McpClient │────▶│ McpSession │────▶│ Connector │────▶│ Transport  │
//! │ (registry)│     │ (lifecycle)│     │ (protocol)│     │ (http/sse) │
//! └───────────┘     └────────────┘     └───────────┘     └────────────┘
//! ```
//!
//! - [`McpClient`] holds named sessions built from a `mcpServers` config.
//! - [`McpSession`] is the observable state machine: auth recovery, retry,
//!   reconnect, health checks, cache refreshes.
//! - [`Connector`] speaks JSON-RPC: handshake, capability-gated listings,
//!   tool calls with progress-aware timeouts, server-initiated requests.
//! - The transports implement streamable HTTP and legacy HTTP+SSE, with
//!   automatic fallback between them.
//!
//! # Example
//!
//! ```no_run
//! use mcplink_client::{McpClient, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = McpClient::new();
//! client
//!     .add_server("web", ServerConfig::new("https://example.com/mcp"))
//!     .await;
//!
//! let session = client.create_session("web").await?;
//! for tool in session.tools().await {
//!     println!("{}: {}", tool.name, tool.description.unwrap_or_default());
//! }
//!
//! let result = session
//!     .call_tool("search", Some(serde_json::json!({"query": "rust"})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod connector;
pub mod error;
mod http;
pub mod protocol;
pub mod session;
mod sse;
pub mod transport;

pub use client::McpClient;
pub use config::{AuthConfig, McpConfig, ServerConfig};
pub use connector::{Authenticator, Connector, ConnectorConfig, TransportPreference};
pub use error::{ClientError, ClientResult};
pub use protocol::{
    GetPromptResult, McpPrompt, McpResource, McpTool, ReadResourceResult, ResourceTemplate,
    ToolCallResult, ToolContent,
};
pub use session::{ConnectionState, LogLevel, McpSession, SessionConfig, SessionEvent};
pub use transport::{
    ErrorClass, FallbackReason, HttpTransportFactory, Transport, TransportError, TransportEvent,
    TransportFactory, TransportKind,
};
