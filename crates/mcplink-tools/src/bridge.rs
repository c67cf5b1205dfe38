//! Conversion of whole sessions into adapter sets.

use crate::adapters::{McpToolAdapter, PromptAdapter, ResourceAdapter};
use crate::AgentTool;
use mcplink_client::McpSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Builds the [`AgentTool`] set for sessions, remembering which sessions
/// it already processed so adapters are not rebuilt on every agent turn.
///
/// The cache is owned by the instance: construct one bridge where you
/// construct your agent, and drop them together.
pub struct ToolBridge {
    /// Adapter sets keyed by session identity.
    cache: Mutex<HashMap<usize, Vec<Arc<dyn AgentTool>>>>,
}

impl ToolBridge {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Every adapter for this session: tools, then resources, then
    /// prompts. Listing failures degrade to whatever could be listed,
    /// with a warning.
    pub async fn tools_for(&self, session: &Arc<McpSession>) -> Vec<Arc<dyn AgentTool>> {
        let key = session_key(session);
        if let Some(cached) = self.cache.lock().await.get(&key) {
            return cached.clone();
        }

        let mut tools: Vec<Arc<dyn AgentTool>> = Vec::new();
        for tool in session.tools().await {
            tools.push(Arc::new(McpToolAdapter::new(Arc::clone(session), tool)));
        }
        match session.list_resources().await {
            Ok(resources) => {
                for resource in resources {
                    tools.push(Arc::new(ResourceAdapter::new(Arc::clone(session), resource)));
                }
            }
            Err(e) => warn!(server = %session.name(), error = %e, "Skipping resources"),
        }
        match session.list_prompts().await {
            Ok(prompts) => {
                for prompt in prompts {
                    tools.push(Arc::new(PromptAdapter::new(Arc::clone(session), prompt)));
                }
            }
            Err(e) => warn!(server = %session.name(), error = %e, "Skipping prompts"),
        }

        self.cache.lock().await.insert(key, tools.clone());
        tools
    }

    /// Forget a session's adapters, forcing a rebuild on next use. Call
    /// after the session's tool list changed.
    pub async fn invalidate(&self, session: &Arc<McpSession>) {
        self.cache.lock().await.remove(&session_key(session));
    }
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn session_key(session: &Arc<McpSession>) -> usize {
    Arc::as_ptr(session) as usize
}
