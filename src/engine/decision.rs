//! Bounded reasoning / tool-call loop.
//!
//! Each step asks the model for its next move. Ordinary tool calls are run
//! through the gateway and their results fed back; the two control tools
//! end the loop:
//!
//! - `complete_task(summary)` → [`Outcome::Completed`]
//! - `request_decision(decision_type, prompt)` → [`Outcome::EscalationRequested`]
//!
//! The loop is bounded by an iteration count and a wall-clock timeout.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::llm::{
    ChatMessage, LlmProvider, Reasoning, ReasoningContext, RespondResult, RetryPolicy, ToolCall,
    ToolDefinition,
};
use crate::tools::{ToolContext, ToolGateway};

pub const COMPLETE_TASK_TOOL: &str = "complete_task";
pub const REQUEST_DECISION_TOOL: &str = "request_decision";

/// Fatal reasons.
pub const LOOP_EXHAUSTED: &str = "loop_exhausted";
pub const TOOL_FATAL: &str = "tool_fatal";
pub const MODEL_ERROR: &str = "model_error";

const SYSTEM_PROMPT: &str = "You are an autonomous worker processing one task from a queue. \
Use the available tools to gather what you need and to act. \
When the task is finished, call complete_task with a short summary of what was done. \
If you need a human to decide something or to supply missing information, call \
request_decision with a decision_type and a clear, self-contained prompt. \
Always answer with a tool call.";

const NUDGE: &str = "Reply with a tool call. Call complete_task when the work is done, \
or request_decision if you need a human.";

/// Result of a decision or of a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        summary: String,
    },
    EscalationRequested {
        decision_type: String,
        prompt: String,
    },
    /// Intermediate: the step ran tools (or nudged the model) and the loop
    /// should continue.
    ToolInvoked {
        invocations: Vec<ToolInvocation>,
    },
    Fatal {
        reason: String,
        detail: String,
    },
}

impl Outcome {
    pub fn fatal(reason: &str, detail: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the loop stops on this outcome.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::ToolInvoked { .. })
    }
}

/// One tool call made during a step.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub succeeded: bool,
    /// What the model was shown.
    pub observation: String,
}

/// Drives the model until it completes, escalates or gives up.
pub struct DecisionLoop {
    reasoning: Reasoning,
    tools: Arc<dyn ToolGateway>,
    max_iterations: usize,
    timeout: Duration,
}

impl DecisionLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolGateway>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            reasoning: Reasoning::new(llm).with_system_prompt(SYSTEM_PROMPT),
            tools,
            max_iterations: config.max_decision_iterations,
            timeout: config.decision_timeout,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.reasoning = self.reasoning.with_retry_policy(policy);
        self
    }

    /// Run the loop for one task. Never returns [`Outcome::ToolInvoked`].
    pub async fn decide(&self, payload: &super::ContextPayload) -> Outcome {
        let ctx = ToolContext::new(payload.task.id, payload.task.title.clone());
        let mut tools = self.tools.definitions().await;
        tools.extend(control_tool_definitions());
        let first = ChatMessage::user(payload.render());

        let bounded = async {
            let mut messages = vec![first];
            for iteration in 1..=self.max_iterations {
                debug!(task_id = %ctx.task_id, iteration, "Decision step");
                let outcome = self.step(&mut messages, &tools, &ctx).await;
                if outcome.is_final() {
                    return outcome;
                }
            }
            warn!(
                task_id = %ctx.task_id,
                max_iterations = self.max_iterations,
                "Decision loop exhausted its iterations"
            );
            Outcome::fatal(
                LOOP_EXHAUSTED,
                format!("no decision after {} iterations", self.max_iterations),
            )
        };

        match tokio::time::timeout(self.timeout, bounded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task_id = %ctx.task_id, timeout_secs = self.timeout.as_secs(), "Decision timed out");
                Outcome::fatal(
                    LOOP_EXHAUSTED,
                    format!("no decision within {}s", self.timeout.as_secs()),
                )
            }
        }
    }

    /// One model turn plus the tool calls it asked for.
    pub async fn step(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolDefinition],
        ctx: &ToolContext,
    ) -> Outcome {
        let reason_ctx = ReasoningContext::new()
            .with_messages(messages.clone())
            .with_tools(tools.to_vec())
            .with_metadata("task_id", ctx.task_id.to_string());

        let output = match self.reasoning.respond_with_tools(&reason_ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(task_id = %ctx.task_id, error = %e, "Model call failed");
                return Outcome::fatal(MODEL_ERROR, e.to_string());
            }
        };
        debug!(
            task_id = %ctx.task_id,
            input_tokens = output.usage.input_tokens,
            output_tokens = output.usage.output_tokens,
            total_tokens = output.usage.total(),
            "Model replied"
        );

        let (tool_calls, content) = match output.result {
            RespondResult::Text(text) => {
                debug!(task_id = %ctx.task_id, "Text-only reply, nudging");
                messages.push(ChatMessage::assistant(text));
                messages.push(ChatMessage::user(NUDGE));
                return Outcome::ToolInvoked {
                    invocations: Vec::new(),
                };
            }
            RespondResult::ToolCalls {
                tool_calls,
                content,
            } => (tool_calls, content),
        };

        messages.push(ChatMessage::assistant_with_tool_calls(
            content,
            tool_calls.clone(),
        ));

        let mut invocations = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            let result = match call.name.as_str() {
                COMPLETE_TASK_TOOL => match parse_complete(&call.arguments) {
                    Ok(summary) => {
                        info!(task_id = %ctx.task_id, "Model completed the task");
                        return Outcome::Completed { summary };
                    }
                    Err(msg) => Err(msg),
                },
                REQUEST_DECISION_TOOL => match parse_request_decision(&call.arguments) {
                    Ok((decision_type, prompt)) => {
                        info!(task_id = %ctx.task_id, decision_type = %decision_type, "Model requested a decision");
                        return Outcome::EscalationRequested {
                            decision_type,
                            prompt,
                        };
                    }
                    Err(msg) => Err(msg),
                },
                _ => match self.tools.invoke(&call.name, call.arguments.clone(), ctx).await {
                    Ok(output) => Ok(output.to_observation()),
                    Err(e) if e.is_fatal() => {
                        return Outcome::fatal(TOOL_FATAL, e.to_string());
                    }
                    Err(e) => Err(e.to_string()),
                },
            };
            invocations.push(record(messages, call, result));
        }

        Outcome::ToolInvoked { invocations }
    }
}

/// Feed a tool result back to the model and keep a record of it.
fn record(
    messages: &mut Vec<ChatMessage>,
    call: &ToolCall,
    result: Result<String, String>,
) -> ToolInvocation {
    let (succeeded, observation) = match result {
        Ok(text) => (true, text),
        Err(msg) => (false, format!("Error: {msg}")),
    };
    messages.push(ChatMessage::tool_result(&call.id, &call.name, &observation));
    ToolInvocation {
        call_id: call.id.clone(),
        name: call.name.clone(),
        succeeded,
        observation,
    }
}

fn non_empty_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| format!("'{key}' is required and must be a non-empty string"))
}

fn parse_complete(args: &Value) -> Result<String, String> {
    non_empty_str(args, "summary")
}

fn parse_request_decision(args: &Value) -> Result<(String, String), String> {
    Ok((
        non_empty_str(args, "decision_type")?,
        non_empty_str(args, "prompt")?,
    ))
}

/// Definitions of the control tools the loop handles itself.
pub fn control_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: COMPLETE_TASK_TOOL.to_string(),
            description: "Mark the task as done. Call this once the work is finished."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "summary": {
                        "type": "string",
                        "description": "Short summary of what was done"
                    }
                },
                "required": ["summary"]
            }),
        },
        ToolDefinition {
            name: REQUEST_DECISION_TOOL.to_string(),
            description: "Pause the task and ask a human to decide or provide information."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "decision_type": {
                        "type": "string",
                        "description": "Kind of decision, e.g. email_approval or missing_info"
                    },
                    "prompt": {
                        "type": "string",
                        "description": "Question for the human, readable without other context"
                    }
                },
                "required": ["decision_type", "prompt"]
            }),
        },
    ]
}
