//! `read_task`: look up a task and its recent history.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::TaskStore;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput};

/// Most comments returned per call.
const MAX_COMMENTS: usize = 20;

pub struct ReadTaskTool {
    store: Arc<dyn TaskStore>,
}

impl ReadTaskTool {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ReadTaskTool {
    fn name(&self) -> &str {
        "read_task"
    }

    fn description(&self) -> &str {
        "Read a task's status, description and latest comments. Defaults to the \
         current task; pass task_id to read a related one."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "Task UUID (default: the current task)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let task_id = match params.get("task_id").and_then(|v| v.as_str()) {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|e| ToolError::InvalidParameters(format!("task_id: {e}")))?,
            None => ctx.task_id,
        };

        let task = self
            .store
            .get(task_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .ok_or_else(|| ToolError::InvalidParameters(format!("no task {task_id}")))?;

        let skip = task.comments.len().saturating_sub(MAX_COMMENTS);
        let comments: Vec<_> = task
            .comments
            .iter()
            .skip(skip)
            .map(|c| {
                serde_json::json!({
                    "author": c.author,
                    "content": c.content,
                    "created_at": c.created_at,
                })
            })
            .collect();

        let output = serde_json::json!({
            "id": task.id,
            "title": task.title,
            "description": task.description,
            "status": task.status,
            "tags": task.tags,
            "summary": task.summary,
            "comments": comments,
        });
        Ok(ToolOutput::success(output, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::{Comment, Task};
    use serde_json::json;

    #[tokio::test]
    async fn reads_current_task_by_default() {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let task = Task::new("Email Bob").with_description("Ask about the invoice");
        store.create_task(&task).await.unwrap();
        store
            .append_comment(&Comment::human(task.id, "Use the new address"))
            .await
            .unwrap();

        let tool = ReadTaskTool::new(Arc::clone(&store));
        let out = tool
            .execute(json!({}), &ToolContext::new(task.id, "Email Bob"))
            .await
            .unwrap();
        assert_eq!(out.result["title"], "Email Bob");
        assert_eq!(out.result["status"], "new");
        assert_eq!(out.result["comments"][0]["author"], "human");
    }

    #[tokio::test]
    async fn unknown_or_malformed_id_is_invalid() {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tool = ReadTaskTool::new(store);
        let ctx = ToolContext::new(Uuid::new_v4(), "x");

        let err = tool.execute(json!({"task_id": "nope"}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let err = tool.execute(json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
