//! Adapters turning MCP primitives into [`AgentTool`]s.

use crate::AgentTool;
use async_trait::async_trait;
use mcplink_client::protocol::{McpPrompt, McpResource, McpTool, ResourceContent, ToolContent};
use mcplink_client::McpSession;
use serde_json::{json, Value};
use std::sync::Arc;

/// Restrict a name to `[A-Za-z0-9_]`, the character set model-facing tool
/// identifiers allow. Everything else becomes an underscore.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Render tool result content as one string.
fn flatten_content(content: &[ToolContent]) -> String {
    let parts: Vec<String> = content
        .iter()
        .map(|item| match item {
            ToolContent::Text { text } => text.clone(),
            ToolContent::Image { data, mime_type } => {
                format!("[Image: {} bytes, type: {}]", data.len(), mime_type)
            }
            ToolContent::Resource { resource } => match &resource.text {
                Some(text) => text.clone(),
                None => format!("[Resource: {}]", resource.uri),
            },
        })
        .collect();
    parts.join("\n")
}

/// Render read-resource contents as one string.
fn flatten_resource_contents(contents: &[ResourceContent]) -> String {
    let parts: Vec<String> = contents
        .iter()
        .map(|item| {
            if let Some(text) = &item.text {
                text.clone()
            } else if let Some(blob) = &item.blob {
                format!("[{}: {} base64 bytes]", item.uri, blob.len())
            } else {
                format!("[{}: empty]", item.uri)
            }
        })
        .collect();
    parts.join("\n")
}

fn arguments_from(args: Value) -> Option<Value> {
    if args.is_null() {
        None
    } else {
        Some(args)
    }
}

// ============================================================================
// Tools
// ============================================================================

/// Exposes one MCP tool as an [`AgentTool`], named `{server}_{tool}` so
/// tools from different servers never collide.
pub struct McpToolAdapter {
    session: Arc<McpSession>,
    tool: McpTool,
    name: String,
}

impl McpToolAdapter {
    pub fn new(session: Arc<McpSession>, tool: McpTool) -> Self {
        let name = sanitize(&format!("{}_{}", session.name(), tool.name));
        Self {
            session,
            tool,
            name,
        }
    }
}

#[async_trait]
impl AgentTool for McpToolAdapter {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.tool
            .description
            .clone()
            .unwrap_or_else(|| format!("MCP tool {}", self.tool.name))
    }

    fn parameters(&self) -> Value {
        self.tool
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}))
    }

    async fn call(&self, args: Value) -> String {
        match self
            .session
            .call_tool(&self.tool.name, arguments_from(args))
            .await
        {
            Ok(result) => {
                let text = flatten_content(&result.content);
                if result.is_error {
                    format!("Error: {text}")
                } else {
                    text
                }
            }
            Err(e) => format!("Error: {e}"),
        }
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Exposes one MCP resource as a no-argument read tool.
pub struct ResourceAdapter {
    session: Arc<McpSession>,
    resource: McpResource,
    name: String,
}

impl ResourceAdapter {
    pub fn new(session: Arc<McpSession>, resource: McpResource) -> Self {
        let name = format!("read_{}", sanitize(&resource.name));
        Self {
            session,
            resource,
            name,
        }
    }
}

#[async_trait]
impl AgentTool for ResourceAdapter {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.resource
            .description
            .clone()
            .unwrap_or_else(|| format!("Read {}", self.resource.uri))
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: Value) -> String {
        match self.session.read_resource(&self.resource.uri).await {
            Ok(result) => flatten_resource_contents(&result.contents),
            Err(e) => format!("Error: {e}"),
        }
    }
}

// ============================================================================
// Prompts
// ============================================================================

/// Exposes one MCP prompt as a tool that renders the prompt's messages.
///
/// The protocol declares prompt arguments without types, so the schema
/// types them all as strings.
pub struct PromptAdapter {
    session: Arc<McpSession>,
    prompt: McpPrompt,
    name: String,
}

impl PromptAdapter {
    pub fn new(session: Arc<McpSession>, prompt: McpPrompt) -> Self {
        let name = sanitize(&prompt.name);
        Self {
            session,
            prompt,
            name,
        }
    }
}

#[async_trait]
impl AgentTool for PromptAdapter {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.prompt
            .description
            .clone()
            .unwrap_or_else(|| format!("Render the {} prompt", self.prompt.name))
    }

    fn parameters(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for arg in &self.prompt.arguments {
            let mut prop = serde_json::Map::new();
            prop.insert("type".to_string(), json!("string"));
            if let Some(desc) = &arg.description {
                prop.insert("description".to_string(), json!(desc));
            }
            properties.insert(arg.name.clone(), Value::Object(prop));
            if arg.required {
                required.push(json!(arg.name));
            }
        }
        json!({"type": "object", "properties": properties, "required": required})
    }

    async fn call(&self, args: Value) -> String {
        match self
            .session
            .get_prompt(&self.prompt.name, arguments_from(args))
            .await
        {
            Ok(result) => {
                let parts: Vec<String> = result
                    .messages
                    .iter()
                    .map(|m| match m.content.get("text").and_then(Value::as_str) {
                        Some(text) => text.to_string(),
                        None => m.content.to_string(),
                    })
                    .collect();
                parts.join("\n")
            }
            Err(e) => format!("Error: {e}"),
        }
    }
}
