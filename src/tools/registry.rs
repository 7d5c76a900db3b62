//! Tool registry for managing available tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ToolError;
use crate::llm::ToolDefinition;
use crate::tools::gateway::{GatewayError, ToolGateway};
use crate::tools::tool::{Tool, ToolContext, ToolOutput};

/// Names owned by the decision loop itself. Never registrable.
pub const RESERVED_TOOL_NAMES: &[&str] = &["complete_task", "request_decision"];

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool at startup. Reserved names are rejected.
    pub fn register_sync(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if RESERVED_TOOL_NAMES.contains(&name.as_str()) {
            tracing::warn!(tool = %name, "Rejected tool registration: reserved name");
            return;
        }
        if let Ok(mut tools) = self.tools.try_write() {
            tools.insert(name.clone(), tool);
            tracing::debug!("Registered tool: {}", name);
        }
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// List all tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get tool definitions for LLM function calling, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run a tool under its execution timeout.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.get(name).await.ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        let timeout = tool.execution_timeout();

        tracing::debug!(tool = name, task_id = %ctx.task_id, "Executing tool");
        match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout,
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolGateway for ToolRegistry {
    async fn definitions(&self) -> Vec<ToolDefinition> {
        self.tool_definitions().await
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, GatewayError> {
        self.execute(name, arguments, ctx).await.map_err(|e| {
            let err = GatewayError::new(name, e);
            tracing::warn!(tool = name, kind = ?err.kind, error = %err.source, "Tool call failed");
            err
        })
    }
}
