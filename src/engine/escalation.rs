//! Human escalation: suspend a task on a question, resume it on a reply.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::{persist_transition, persist_transition_with_comment};
use crate::error::{Error, TransitionError};
use crate::store::TaskStore;
use crate::tasks::{
    AuthorKind, Comment, EventEmitter, StatusChange, Task, TaskStatus, TransitionEvent,
};

/// Result of [`EscalationHandler::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The task went back to `todo` and the comment was recorded.
    Resumed,
    /// The task was not waiting on a human. Nothing was written by `resume`.
    NotAwaiting { status: TaskStatus },
}

pub struct EscalationHandler {
    store: Arc<dyn TaskStore>,
    events: EventEmitter,
}

impl EscalationHandler {
    pub fn new(store: Arc<dyn TaskStore>, events: EventEmitter) -> Self {
        Self { store, events }
    }

    /// Park an in-progress task on a human decision.
    ///
    /// The prompt is recorded as an agent comment. This frees the
    /// single-flight slot.
    pub async fn escalate(
        &self,
        task_id: Uuid,
        decision_type: &str,
        prompt: &str,
    ) -> Result<StatusChange, Error> {
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(Error::TaskNotFound { id: task_id })?;

        self.escalate_task(&mut task, decision_type, prompt)
            .await?
            .ok_or_else(|| {
                TransitionError::ConcurrencyViolation {
                    id: task_id,
                    reason: "status changed before escalation".to_string(),
                }
                .into()
            })
    }

    /// Escalate from a snapshot the caller already holds. `Ok(None)` means
    /// the stored status no longer matches `task`; nothing was written.
    pub(crate) async fn escalate_task(
        &self,
        task: &mut Task,
        decision_type: &str,
        prompt: &str,
    ) -> Result<Option<StatusChange>, Error> {
        let event = TransitionEvent::Escalated {
            decision_type: decision_type.to_string(),
            prompt: prompt.to_string(),
        };
        let prompt_comment = Comment::agent(task.id, prompt);
        let Some(change) =
            persist_transition_with_comment(self.store.as_ref(), task, event, prompt_comment)
                .await?
        else {
            return Ok(None);
        };

        info!(task_id = %task.id, decision_type, "Task awaiting human decision");
        self.events.emit_change(&change, &task.title);
        Ok(Some(change))
    }

    /// Resume an awaiting task with the human's reply.
    ///
    /// A no-op for tasks in any other status. Of two racing resumes only the
    /// one that wins the status write records its comment. The reply and the
    /// status change are written together, so a claimed task always sees it.
    pub async fn resume(&self, task_id: Uuid, human_comment: &str) -> Result<ResumeOutcome, Error> {
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(Error::TaskNotFound { id: task_id })?;

        if task.status != TaskStatus::AwaitingDecision {
            debug!(task_id = %task_id, status = %task.status, "Resume ignored, task not awaiting");
            return Ok(ResumeOutcome::NotAwaiting {
                status: task.status,
            });
        }

        let reply = Comment::human(task_id, human_comment);
        let Some(change) = persist_transition_with_comment(
            self.store.as_ref(),
            &mut task,
            TransitionEvent::HumanCommented,
            reply,
        )
        .await?
        else {
            let status = self
                .store
                .get(task_id)
                .await?
                .map(|t| t.status)
                .unwrap_or(task.status);
            debug!(task_id = %task_id, status = %status, "Resume lost the race");
            return Ok(ResumeOutcome::NotAwaiting { status });
        };

        info!(task_id = %task_id, "Task resumed by human reply");
        self.events.emit_change(&change, &task.title);
        Ok(ResumeOutcome::Resumed)
    }

    /// Record a human comment: resumes an awaiting task, otherwise the
    /// comment is kept as plain history.
    pub async fn on_human_comment(&self, task_id: Uuid, text: &str) -> Result<ResumeOutcome, Error> {
        let outcome = self.resume(task_id, text).await?;
        if let ResumeOutcome::NotAwaiting { .. } = outcome {
            self.store
                .append_comment(&Comment::human(task_id, text))
                .await?;
        }
        Ok(outcome)
    }

    /// Resume every awaiting task whose newest comment is a human reply.
    ///
    /// Picks up replies written straight into the store. The escalation
    /// prompt is written with the status change, so a human comment after it
    /// is always an answer. Returns how many tasks were resumed.
    pub async fn resume_answered(&self) -> Result<usize, Error> {
        let mut resumed = 0;
        for mut task in self.store.list_by_status(TaskStatus::AwaitingDecision).await? {
            let newest = self.store.list_comments(task.id, Some(1)).await?;
            if !newest.last().is_some_and(|c| c.author == AuthorKind::Human) {
                continue;
            }
            match persist_transition(self.store.as_ref(), &mut task, TransitionEvent::HumanCommented)
                .await?
            {
                Some(change) => {
                    info!(task_id = %task.id, "Task resumed by stored human reply");
                    self.events.emit_change(&change, &task.title);
                    resumed += 1;
                }
                None => debug!(task_id = %task.id, "Reply sweep lost the race"),
            }
        }
        Ok(resumed)
    }
}
