//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.
//!
//! rig owns the HTTP transport and the provider wire format. This adapter
//! converts our chat history into rig messages, and rig's choice back into
//! text plus tool calls.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::{self, CompletionModel};
use rig::message::{AssistantContent, Message, ToolResultContent, UserContent};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// `LlmProvider` over any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let (preamble, mut history) = to_rig_messages(&request.messages)?;
        let prompt = history.pop().ok_or_else(|| self.invalid("request has no messages"))?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .tools(request.tools.iter().map(to_rig_tool).collect())
            .max_tokens(u64::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }

        debug!(
            model = %self.model_name,
            task_id = request.metadata.get("task_id").map(String::as_str).unwrap_or("-"),
            tools = request.tools.len(),
            "Sending completion request"
        );
        let response = self
            .model
            .completion(builder.build())
            .await
            .map_err(|e| classify_error(&self.model_name, e.to_string()))?;

        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        for content in response.choice.into_iter() {
            match content {
                AssistantContent::Text(t) => text.push(t.text),
                AssistantContent::ToolCall(call) => tool_calls.push(ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                }),
                _ => {}
            }
        }

        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        };
        let text = text.join("\n");
        Ok(ToolCompletionResponse {
            content: (!text.is_empty()).then_some(text),
            tool_calls,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason,
            response_id: None,
        })
    }
}

impl<M> RigAdapter<M> {
    fn invalid(&self, reason: &str) -> LlmError {
        LlmError::InvalidResponse {
            provider: self.model_name.clone(),
            reason: reason.to_string(),
        }
    }
}

fn to_rig_tool(tool: &ToolDefinition) -> completion::ToolDefinition {
    completion::ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: tool.parameters.clone(),
    }
}

/// Lift system messages into a preamble and convert the rest.
///
/// Consecutive tool results are batched into one user message, which is how
/// providers expect the answers to a multi-call assistant turn.
fn to_rig_messages(messages: &[ChatMessage]) -> Result<(Option<String>, Vec<Message>), LlmError> {
    let mut system = Vec::new();
    let mut out = Vec::with_capacity(messages.len());
    let mut results: Vec<UserContent> = Vec::new();

    for msg in messages {
        if msg.role != Role::Tool && !results.is_empty() {
            out.push(tool_results(std::mem::take(&mut results))?);
        }
        match msg.role {
            Role::System => system.push(msg.content.clone()),
            Role::User => out.push(Message::user(msg.content.clone())),
            Role::Assistant if msg.tool_calls.is_empty() => {
                out.push(Message::assistant(msg.content.clone()))
            }
            Role::Assistant => {
                let mut content = Vec::with_capacity(msg.tool_calls.len() + 1);
                if !msg.content.is_empty() {
                    content.push(AssistantContent::text(msg.content.clone()));
                }
                for call in &msg.tool_calls {
                    content.push(AssistantContent::tool_call(
                        call.id.clone(),
                        call.name.clone(),
                        call.arguments.clone(),
                    ));
                }
                out.push(Message::Assistant {
                    id: None,
                    content: one_or_many(content)?,
                });
            }
            Role::Tool => results.push(UserContent::tool_result(
                msg.tool_call_id.clone().unwrap_or_default(),
                OneOrMany::one(ToolResultContent::text(msg.content.clone())),
            )),
        }
    }
    if !results.is_empty() {
        out.push(tool_results(results)?);
    }

    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((preamble, out))
}

fn tool_results(results: Vec<UserContent>) -> Result<Message, LlmError> {
    Ok(Message::User {
        content: one_or_many(results)?,
    })
}

fn one_or_many<T: Clone>(items: Vec<T>) -> Result<OneOrMany<T>, LlmError> {
    OneOrMany::many(items).map_err(|e| LlmError::InvalidResponse {
        provider: "rig".to_string(),
        reason: format!("empty message content: {e}"),
    })
}

/// Map a rig error onto our retry classes. rig surfaces provider failures
/// as text, so this goes by the status codes and error types it carries.
fn classify_error(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["401", "403", "authentication", "permission_error", "api key", "api-key"]) {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if has(&["429", "rate_limit", "rate limit"]) {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if has(&[
        "overloaded",
        "529",
        "500",
        "502",
        "503",
        "504",
        "timed out",
        "timeout",
        "connection",
    ]) {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    } else {
        LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({"query": "bob"}),
        }
    }

    #[test]
    fn system_messages_become_preamble() {
        let (preamble, messages) = to_rig_messages(&[
            ChatMessage::system("You work tasks."),
            ChatMessage::user("Task: email Bob"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("You work tasks."));
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Message::User { .. }));
    }

    #[test]
    fn tool_results_batch_into_one_user_message() {
        let (_, messages) = to_rig_messages(&[
            ChatMessage::user("go"),
            ChatMessage::assistant_with_tool_calls(
                Some("Looking up".into()),
                vec![call("a", "memory_search"), call("b", "task_lookup")],
            ),
            ChatMessage::tool_result("a", "memory_search", "[]"),
            ChatMessage::tool_result("b", "task_lookup", "{}"),
            ChatMessage::user("Reply with a tool call."),
        ])
        .unwrap();

        assert_eq!(messages.len(), 4);
        match &messages[1] {
            Message::Assistant { content, .. } => {
                assert_eq!(content.len(), 3);
                assert!(content.iter().any(|c| matches!(
                    c,
                    AssistantContent::ToolCall(tc) if tc.id == "b" && tc.function.name == "task_lookup"
                )));
            }
            other => panic!("expected assistant turn, got {other:?}"),
        }
        match &messages[2] {
            Message::User { content, .. } => {
                assert_eq!(content.len(), 2);
                assert!(
                    content
                        .iter()
                        .all(|c| matches!(c, UserContent::ToolResult(_)))
                );
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[test]
    fn trailing_tool_results_flushed() {
        let (_, messages) = to_rig_messages(&[
            ChatMessage::assistant_with_tool_calls(None, vec![call("a", "memory_search")]),
            ChatMessage::tool_result("a", "memory_search", "[]"),
        ])
        .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[1], Message::User { .. }));
    }

    #[test]
    fn errors_classified_for_retry() {
        let auth = classify_error("m", "ProviderError: authentication_error: invalid x-api-key".into());
        assert!(matches!(auth, LlmError::AuthFailed { .. }));
        assert!(!auth.is_retryable());

        let limited = classify_error("m", "ProviderError: rate_limit_error".into());
        assert!(matches!(limited, LlmError::RateLimited { .. }));

        let overloaded = classify_error("m", "ProviderError: overloaded_error: Overloaded".into());
        assert!(overloaded.is_retryable());

        let bad = classify_error("m", "JsonError: missing field `content`".into());
        assert!(matches!(bad, LlmError::InvalidResponse { .. }));
        assert!(!bad.is_retryable());
    }
}
