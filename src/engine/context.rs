//! Context assembly for the decision loop.
//!
//! Gathers everything the model should see about a task: the task itself,
//! linked entities, recent comments and memory facts. Collaborator failures
//! degrade the payload instead of failing it.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::memory::{Fact, MemoryBoundary};
use crate::store::TaskStore;
use crate::tasks::{Comment, EntityRef, Task};

/// Upper bound on a single memory search.
pub const MEMORY_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything handed to the decision loop for one task.
#[derive(Debug, Clone)]
pub struct ContextPayload {
    pub task: Task,
    pub related: Vec<EntityRef>,
    /// Latest comments, oldest first.
    pub comments: Vec<Comment>,
    pub facts: Vec<Fact>,
    /// Memory search failed or timed out; `facts` is empty.
    pub memory_degraded: bool,
    /// Entity or comment lookup failed; those sections may be incomplete.
    pub related_degraded: bool,
}

impl ContextPayload {
    pub fn is_degraded(&self) -> bool {
        self.memory_degraded || self.related_degraded
    }

    /// Render the payload as the text block the model reads.
    pub fn render(&self) -> String {
        let task = &self.task;
        let mut out = String::new();

        let _ = writeln!(out, "# Task: {}", task.title);
        let _ = writeln!(out, "ID: {}", task.id);
        let _ = writeln!(out, "Created: {}", task.created_at.format("%Y-%m-%d %H:%M UTC"));
        if !task.tags.is_empty() {
            let _ = writeln!(out, "Tags: {}", task.tags.join(", "));
        }
        if let Some(desc) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = write!(out, "\n## Description\n{}\n", desc.trim());
        }

        if !self.related.is_empty() {
            out.push_str("\n## Related\n");
            for entity in &self.related {
                match &entity.summary {
                    Some(summary) => {
                        let _ = writeln!(out, "- {} {}: {}", entity.kind.as_str(), entity.name, summary);
                    }
                    None => {
                        let _ = writeln!(out, "- {} {}", entity.kind.as_str(), entity.name);
                    }
                }
            }
        }

        if !self.comments.is_empty() {
            out.push_str("\n## Comments (oldest first)\n");
            for comment in &self.comments {
                let _ = writeln!(
                    out,
                    "[{} {}] {}",
                    comment.created_at.format("%Y-%m-%d %H:%M"),
                    comment.author.as_str(),
                    comment.content
                );
            }
        }

        if !self.facts.is_empty() {
            out.push_str("\n## Memory\n");
            for fact in &self.facts {
                match &fact.source {
                    Some(source) => {
                        let _ = writeln!(out, "- {} ({})", fact.content, source);
                    }
                    None => {
                        let _ = writeln!(out, "- {}", fact.content);
                    }
                }
            }
        }

        if self.memory_degraded {
            out.push_str("\n(Long-term memory was unavailable. Use memory_search if you need it.)\n");
        }
        if self.related_degraded {
            out.push_str("\n(Some related records could not be loaded.)\n");
        }

        out
    }
}

/// Memory query for a task: title, description and tags.
pub fn memory_query_for(task: &Task) -> String {
    let mut parts = vec![task.title.trim().to_string()];
    if let Some(desc) = task.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        parts.push(desc.to_string());
    }
    if !task.tags.is_empty() {
        parts.push(task.tags.join(" "));
    }
    parts.join(" ")
}

/// Builds [`ContextPayload`]s from the store and memory.
pub struct ContextAssembler {
    store: Arc<dyn TaskStore>,
    memory: Arc<dyn MemoryBoundary>,
    memory_search_limit: usize,
    comment_history_limit: usize,
    memory_timeout: Duration,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        memory: Arc<dyn MemoryBoundary>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            memory,
            memory_search_limit: config.memory_search_limit,
            comment_history_limit: config.comment_history_limit,
            memory_timeout: MEMORY_SEARCH_TIMEOUT,
        }
    }

    pub fn with_memory_timeout(mut self, timeout: Duration) -> Self {
        self.memory_timeout = timeout;
        self
    }

    /// Assemble the payload for `task`. Never fails.
    pub async fn assemble(&self, task: &Task) -> ContextPayload {
        let mut related_degraded = false;

        let related = match self.store.related_entities(task.id).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to load related entities");
                related_degraded = true;
                Vec::new()
            }
        };

        let comments = match self
            .store
            .list_comments(task.id, Some(self.comment_history_limit))
            .await
        {
            Ok(comments) => comments,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to load comments");
                related_degraded = true;
                let skip = task.comments.len().saturating_sub(self.comment_history_limit);
                task.comments[skip..].to_vec()
            }
        };

        let (facts, memory_degraded) = self.search_memory(task).await;

        ContextPayload {
            task: task.clone(),
            related,
            comments,
            facts,
            memory_degraded,
            related_degraded,
        }
    }

    async fn search_memory(&self, task: &Task) -> (Vec<Fact>, bool) {
        if self.memory_search_limit == 0 {
            return (Vec::new(), false);
        }
        let query = memory_query_for(task);
        match tokio::time::timeout(
            self.memory_timeout,
            self.memory.search(&query, self.memory_search_limit),
        )
        .await
        {
            Ok(Ok(mut facts)) => {
                facts.truncate(self.memory_search_limit);
                (facts, false)
            }
            Ok(Err(e)) => {
                warn!(task_id = %task.id, error = %e, "Memory search failed, continuing without facts");
                (Vec::new(), true)
            }
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    timeout_ms = self.memory_timeout.as_millis() as u64,
                    "Memory search timed out, continuing without facts"
                );
                (Vec::new(), true)
            }
        }
    }
}
