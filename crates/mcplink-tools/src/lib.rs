//! Agent-framework adapters for MCP.
//!
//! Agent frameworks want a flat list of named tools that take a JSON
//! arguments object and return a string. MCP servers expose tools,
//! resources, and prompts behind a session. This crate bridges the two:
//!
//! ```text
//! ┌────────────┐    ┌─────────────────┐    ┌────────────┐
//! │ agent      │───▶│ AgentTool       │───▶│ McpSession │
//! │ framework  │    │ (adapters)      │    │            │
//! └────────────┘    └─────────────────┘    └────────────┘
//! ```
//!
//! Adapter calls never fail: errors come back as human-readable strings,
//! because that is what the consuming framework feeds to the model.

mod adapters;
mod bridge;
#[cfg(test)]
mod test_support;

pub use adapters::{McpToolAdapter, PromptAdapter, ResourceAdapter};
pub use bridge::ToolBridge;

use async_trait::async_trait;

/// The shape agent frameworks expect a tool in.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Unique tool name, safe for model-facing tool identifiers.
    fn name(&self) -> String;

    /// Human-readable description shown to the model.
    fn description(&self) -> String;

    /// JSON schema for the arguments object.
    fn parameters(&self) -> serde_json::Value;

    /// Run the tool. Never fails; errors are rendered into the string.
    async fn call(&self, args: serde_json::Value) -> String;
}
