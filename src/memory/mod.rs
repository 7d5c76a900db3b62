//! Long-term memory boundary.
//!
//! The engine reads facts relevant to a task before deciding and writes a
//! summary back after completing it. Both directions are best-effort: a
//! memory outage degrades context, it never fails a task.

pub mod http;
pub mod workspace;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

pub use http::HttpMemory;
pub use workspace::WorkspaceMemory;

/// A single retrieved fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub content: String,
    /// Where the fact came from (file path, episode name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Relevance in `0.0..=1.0`, higher is better.
    #[serde(default)]
    pub score: f32,
}

impl Fact {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: None,
            score: 0.0,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }
}

/// Searchable long-term memory.
#[async_trait]
pub trait MemoryBoundary: Send + Sync {
    /// Up to `limit` facts relevant to `query`, most relevant first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Fact>, MemoryError>;

    /// Record new content. `source_description` says what produced it.
    async fn add(&self, content: &str, source_description: &str) -> Result<(), MemoryError>;
}

/// Memory that remembers nothing. Used when no backend is configured.
pub struct NoopMemory;

#[async_trait]
impl MemoryBoundary for NoopMemory {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Fact>, MemoryError> {
        Ok(Vec::new())
    }

    async fn add(&self, _content: &str, _source_description: &str) -> Result<(), MemoryError> {
        Ok(())
    }
}
