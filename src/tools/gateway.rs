//! Tool gateway boundary.
//!
//! The decision loop only sees this trait: a list of definitions and a way to
//! invoke one by name. Failures come back classified so the loop knows
//! whether to feed the error to the model or stop.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::llm::ToolDefinition;
use crate::tools::tool::{ToolContext, ToolOutput};

/// Whether a tool failure is worth showing to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// The model can react (bad arguments, timeout, flaky backend).
    Transient,
    /// Nothing the model does will help.
    Fatal,
}

/// A classified tool failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{tool}: {source}")]
pub struct GatewayError {
    pub tool: String,
    pub kind: ToolFailureKind,
    #[source]
    pub source: ToolError,
}

impl GatewayError {
    pub fn new(tool: impl Into<String>, source: ToolError) -> Self {
        let kind = match source {
            ToolError::Fatal(_) | ToolError::NotAuthorized(_) => ToolFailureKind::Fatal,
            _ => ToolFailureKind::Transient,
        };
        Self {
            tool: tool.into(),
            kind,
            source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ToolFailureKind::Fatal
    }
}

/// Something that can run tools by name.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Tools the model may call.
    async fn definitions(&self) -> Vec<ToolDefinition>;

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, GatewayError>;
}
