//! File-backed workspace memory.
//!
//! The workspace is a directory on disk. Any `.md`/`.txt` file under it is
//! searchable; completion summaries land in daily logs at
//! `memory/YYYY-MM-DD.md`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;

use crate::error::MemoryError;
use crate::memory::{Fact, MemoryBoundary};

/// Longest snippet returned per matching line.
const SNIPPET_CHARS: usize = 200;

/// Shorter terms are dropped from queries.
const MIN_TERM_CHARS: usize = 3;

/// Words that match almost every line.
const STOP_WORDS: &[&str] = &[
    "about", "all", "and", "any", "are", "but", "can", "for", "from", "had", "has", "have",
    "her", "his", "how", "into", "its", "not", "our", "out", "please", "she", "than", "that",
    "the", "their", "them", "then", "there", "they", "this", "was", "were", "what", "when",
    "which", "who", "will", "with", "you", "your",
];

/// Lowercased, deduplicated query terms worth matching on.
fn search_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TERM_CHARS && !STOP_WORDS.contains(w))
    {
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}

/// File-backed long-term memory.
pub struct WorkspaceMemory {
    base_path: PathBuf,
}

impl WorkspaceMemory {
    /// Create a memory rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Ensure the workspace directory structure exists.
    pub async fn ensure_dirs(&self) -> Result<(), MemoryError> {
        fs::create_dir_all(self.base_path.join("memory")).await?;
        Ok(())
    }

    /// Read a file relative to the workspace root.
    pub async fn read(&self, path: &str) -> Result<String, MemoryError> {
        let full_path = self.base_path.join(path);
        if !full_path.exists() {
            return Err(MemoryError::Unavailable(format!("{path} not found")));
        }
        Ok(fs::read_to_string(&full_path).await?)
    }

    /// Relative path of today's daily log.
    pub fn daily_log_path() -> String {
        format!("memory/{}.md", Utc::now().format("%Y-%m-%d"))
    }

    /// Append content to a file in the workspace (creates if missing).
    async fn append(&self, path: &str, content: &str) -> Result<(), MemoryError> {
        let full_path = self.base_path.join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let existing = if full_path.exists() {
            fs::read_to_string(&full_path).await?
        } else {
            String::new()
        };
        let new_content = if existing.is_empty() {
            content.trim_start().to_string()
        } else {
            format!("{}\n{}", existing.trim_end(), content)
        };
        fs::write(&full_path, new_content).await?;
        Ok(())
    }

    /// Recursively score lines in a directory against the query terms.
    fn search_dir<'a>(
        &'a self,
        dir: &'a Path,
        terms: &'a [String],
        results: &'a mut Vec<Fact>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), MemoryError>> + Send + 'a>>
    {
        Box::pin(async move {
            if !dir.exists() {
                return Ok(());
            }
            let mut read_dir = fs::read_dir(dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;

                if metadata.is_dir() {
                    let name = entry.file_name();
                    if !name.to_string_lossy().starts_with('.') {
                        self.search_dir(&path, terms, results).await?;
                    }
                } else if metadata.is_file()
                    && matches!(path.extension().and_then(|e| e.to_str()), Some("md" | "txt"))
                    && let Ok(content) = fs::read_to_string(&path).await
                {
                    let rel_path = path
                        .strip_prefix(&self.base_path)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .to_string();

                    for (line_num, line) in content.lines().enumerate() {
                        let line_lower = line.to_lowercase();
                        let matched = terms.iter().filter(|t| line_lower.contains(t.as_str())).count();
                        if matched > 0 {
                            let score = matched as f32 / terms.len() as f32;
                            results.push(
                                Fact::new(line.chars().take(SNIPPET_CHARS).collect::<String>())
                                    .with_source(format!("{rel_path}:{}", line_num + 1))
                                    .with_score(score),
                            );
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl MemoryBoundary for WorkspaceMemory {
    /// Case-insensitive keyword search, line by line. Short words and stop
    /// words are not search terms.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Fact>, MemoryError> {
        let terms = search_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        self.search_dir(&self.base_path, &terms, &mut results).await?;

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    async fn add(&self, content: &str, source_description: &str) -> Result<(), MemoryError> {
        if content.trim().is_empty() {
            return Err(MemoryError::Rejected("empty content".to_string()));
        }
        let timestamp = Utc::now().format("%H:%M UTC");
        let entry = format!("\n## {timestamp} ({source_description})\n\n{content}");
        self.append(&Self::daily_log_path(), &entry).await
    }
}
