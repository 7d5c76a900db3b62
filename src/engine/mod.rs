//! The autonomous task-processing engine.
//!
//! ```text
//! Scheduler ──► ContextAssembler ──► DecisionLoop ──► Engine::apply_outcome
//!   (claim)        (store+memory)      (llm+tools)       │
//!                                                         ├─ Done / Failed
//!                                                         └─ EscalationHandler ─► AwaitingDecision
//! ```
//!
//! Every status write goes through the store's compare-and-swap, and every
//! applied write emits one event.

pub mod context;
pub mod control;
pub mod decision;
pub mod escalation;
pub mod runner;
pub mod scheduler;

pub use context::{ContextAssembler, ContextPayload, MEMORY_SEARCH_TIMEOUT, memory_query_for};
pub use control::TaskControl;
pub use decision::{DecisionLoop, Outcome, ToolInvocation};
pub use escalation::{EscalationHandler, ResumeOutcome};
pub use runner::{Engine, TickOutcome};
pub use scheduler::{MAX_CLAIM_ATTEMPTS, Scheduler};

use chrono::Utc;

use crate::error::Error;
use crate::store::TaskStore;
use crate::tasks::{Comment, StatusChange, Task, TransitionEvent};

/// Validate `event` against `task`, then write it with a CAS on the task's
/// current status.
///
/// Illegal transitions are rejected before touching the store. Returns
/// `Ok(None)` when the stored status moved underneath us; `task` is only
/// updated when the write wins.
pub(crate) async fn persist_transition(
    store: &dyn TaskStore,
    task: &mut Task,
    event: TransitionEvent,
) -> Result<Option<StatusChange>, Error> {
    write_transition(store, task, event, None).await
}

/// Like [`persist_transition`], but `comment` is appended in the same
/// store transaction. Either both land or neither does.
pub(crate) async fn persist_transition_with_comment(
    store: &dyn TaskStore,
    task: &mut Task,
    event: TransitionEvent,
    comment: Comment,
) -> Result<Option<StatusChange>, Error> {
    write_transition(store, task, event, Some(comment)).await
}

async fn write_transition(
    store: &dyn TaskStore,
    task: &mut Task,
    event: TransitionEvent,
    comment: Option<Comment>,
) -> Result<Option<StatusChange>, Error> {
    let mut next = task.clone();
    let change = next.apply(event, Utc::now())?;
    let fields = change.event.fields(change.timestamp);

    let won = match &comment {
        Some(comment) => {
            store
                .update_status_with_comment(task.id, change.from, change.to, &fields, comment)
                .await?
        }
        None => {
            store
                .update_status(task.id, change.from, change.to, &fields)
                .await?
        }
    };
    if !won {
        tracing::debug!(
            task_id = %task.id,
            from = %change.from,
            to = %change.to,
            "Status write lost compare-and-swap"
        );
        return Ok(None);
    }

    next.comments.extend(comment);
    *task = next;
    Ok(Some(change))
}
