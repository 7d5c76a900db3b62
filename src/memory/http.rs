//! HTTP client for a graph-memory service.
//!
//! Speaks the minimal surface the engine needs: `POST /search` for facts and
//! `POST /messages` to record episodes. Every failure (connect, status,
//! decode) maps to [`MemoryError::Unavailable`] so callers can degrade.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::memory::{Fact, MemoryBoundary};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Graph-memory client.
pub struct HttpMemory {
    client: reqwest::Client,
    base_url: String,
    group_id: String,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_facts: usize,
    group_ids: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    facts: Vec<RemoteFact>,
}

#[derive(Debug, Deserialize)]
struct RemoteFact {
    fact: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddMessagesRequest<'a> {
    group_id: &'a str,
    messages: Vec<RemoteMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct RemoteMessage<'a> {
    content: &'a str,
    role_type: &'static str,
    role: &'a str,
    source_description: &'a str,
    timestamp: String,
}

impl HttpMemory {
    pub fn new(base_url: impl Into<String>, group_id: impl Into<String>) -> Result<Self, MemoryError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| MemoryError::Unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            group_id: group_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, MemoryError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| MemoryError::Unavailable(format!("POST {path}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Unavailable(format!(
                "POST {path} returned {status}: {body}"
            )));
        }
        Ok(resp)
    }
}

fn facts_from_response(resp: SearchResponse, limit: usize) -> Vec<Fact> {
    let total = resp.facts.len().max(1) as f32;
    resp.facts
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(rank, remote)| {
            // The service returns facts ranked; keep that order as a score.
            let fact = Fact::new(remote.fact).with_score(1.0 - rank as f32 / total);
            match remote.name {
                Some(name) => fact.with_source(name),
                None => fact,
            }
        })
        .collect()
}

#[async_trait]
impl MemoryBoundary for HttpMemory {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Fact>, MemoryError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let body = SearchRequest {
            query,
            max_facts: limit,
            group_ids: [self.group_id.as_str()],
        };
        let resp: SearchResponse = self
            .post("/search", &body)
            .await?
            .json()
            .await
            .map_err(|e| MemoryError::Unavailable(format!("Invalid search response: {e}")))?;
        Ok(facts_from_response(resp, limit))
    }

    async fn add(&self, content: &str, source_description: &str) -> Result<(), MemoryError> {
        if content.trim().is_empty() {
            return Err(MemoryError::Rejected("empty content".to_string()));
        }
        let body = AddMessagesRequest {
            group_id: &self.group_id,
            messages: vec![RemoteMessage {
                content,
                role_type: "system",
                role: "ai-tasker",
                source_description,
                timestamp: Utc::now().to_rfc3339(),
            }],
        };
        self.post("/messages", &body).await?;
        tracing::debug!(source = source_description, "Memory episode recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let memory = HttpMemory::new("http://localhost:8000/", "tasks").unwrap();
        assert_eq!(memory.url("/search"), "http://localhost:8000/search");
    }

    #[test]
    fn search_request_shape() {
        let body = SearchRequest {
            query: "acme invoice",
            max_facts: 5,
            group_ids: ["tasks"],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["query"], "acme invoice");
        assert_eq!(json["max_facts"], 5);
        assert_eq!(json["group_ids"][0], "tasks");
    }

    #[test]
    fn response_parsing_keeps_rank_order() {
        let resp: SearchResponse = serde_json::from_str(
            r#"{"facts": [
                {"fact": "Bob works at Acme", "name": "WORKS_AT"},
                {"fact": "Acme pays net 30"}
            ]}"#,
        )
        .unwrap();
        let facts = facts_from_response(resp, 10);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].content, "Bob works at Acme");
        assert_eq!(facts[0].source.as_deref(), Some("WORKS_AT"));
        assert!(facts[0].score > facts[1].score);
        assert!(facts[1].source.is_none());
    }

    #[test]
    fn response_without_facts_is_empty() {
        let resp: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(facts_from_response(resp, 10).is_empty());
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        // Port 1 is reserved and closed on test hosts.
        let memory = HttpMemory::new("http://127.0.0.1:1", "tasks").unwrap();
        let err = memory.search("anything", 3).await.unwrap_err();
        assert!(matches!(err, MemoryError::Unavailable(_)));
    }
}
