//! Memory tools: let the decision loop query and extend long-term memory.

use std::sync::Arc;

use async_trait::async_trait;

use crate::memory::MemoryBoundary;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

const DEFAULT_LIMIT: u64 = 5;
const MAX_LIMIT: u64 = 20;

// ── memory_search ───────────────────────────────────────────────────

/// Tool for searching long-term memory.
pub struct MemorySearchTool {
    memory: Arc<dyn MemoryBoundary>,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<dyn MemoryBoundary>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for facts about people, projects, past decisions \
         and preferences. Use it when the provided context is not enough."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query (natural language)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Max results (default: 5, max: 20)",
                    "default": DEFAULT_LIMIT
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let query = require_str(&params, "query")?;
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LIMIT)
            .min(MAX_LIMIT) as usize;

        let facts = self
            .memory
            .search(query, limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Search failed: {e}")))?;

        let output = serde_json::json!({
            "query": query,
            "results": facts,
            "result_count": facts.len(),
        });

        Ok(ToolOutput::success(output, start.elapsed()))
    }
}

// ── memory_add ──────────────────────────────────────────────────────

/// Tool for recording a fact in long-term memory.
pub struct MemoryAddTool {
    memory: Arc<dyn MemoryBoundary>,
}

impl MemoryAddTool {
    pub fn new(memory: Arc<dyn MemoryBoundary>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryAddTool {
    fn name(&self) -> &str {
        "memory_add"
    }

    fn description(&self) -> &str {
        "Record a durable fact learned while working (a preference, a contact \
         detail, a decision). Do not record transient progress."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact to remember"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let content = require_str(&params, "content")?;
        if content.trim().is_empty() {
            return Err(ToolError::InvalidParameters("content cannot be empty".into()));
        }

        let source = format!("task {}: {}", ctx.task_id, ctx.task_title);
        self.memory
            .add(content, &source)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Write failed: {e}")))?;

        Ok(ToolOutput::text("Recorded.", start.elapsed()))
    }
}
