//! The engine run loop.
//!
//! poll → claim → assemble → decide → apply outcome → emit, one task at a
//! time. A task claimed by this loop always leaves `in_progress`: through
//! an outcome, or through a release on shutdown. A failed release is
//! remembered and retried before the next claim.
//!
//! One engine process per database. On start, every `in_progress` task is
//! assumed orphaned and released.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::context::{ContextAssembler, MEMORY_SEARCH_TIMEOUT};
use crate::engine::control::TaskControl;
use crate::engine::decision::{DecisionLoop, Outcome};
use crate::engine::escalation::{EscalationHandler, ResumeOutcome};
use crate::engine::{persist_transition, persist_transition_with_comment};
use crate::engine::scheduler::Scheduler;
use crate::error::Error;
use crate::llm::{LlmProvider, RetryPolicy};
use crate::memory::MemoryBoundary;
use crate::store::TaskStore;
use crate::tasks::{Comment, EventEmitter, Task, TaskStatus, TransitionEvent};
use crate::tools::ToolGateway;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing eligible, or a task is already in progress.
    Idle,
    /// A task was processed and left in `status`.
    Processed { task_id: Uuid, status: TaskStatus },
    /// Shutdown interrupted the decision and the task was released.
    Interrupted { task_id: Uuid },
}

pub struct Engine {
    store: Arc<dyn TaskStore>,
    memory: Arc<dyn MemoryBoundary>,
    events: EventEmitter,
    scheduler: Scheduler,
    assembler: ContextAssembler,
    decision: DecisionLoop,
    escalation: EscalationHandler,
    control: TaskControl,
    config: EngineConfig,
    /// Task whose release failed; retried before the next claim.
    pending_release: Mutex<Option<Uuid>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        memory: Arc<dyn MemoryBoundary>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolGateway>,
        config: EngineConfig,
    ) -> Self {
        let events = EventEmitter::new(config.event_source.clone()).with_store(Arc::clone(&store));
        Self {
            scheduler: Scheduler::new(Arc::clone(&store), events.clone()),
            assembler: ContextAssembler::new(Arc::clone(&store), Arc::clone(&memory), &config),
            decision: DecisionLoop::new(llm, tools, &config),
            escalation: EscalationHandler::new(Arc::clone(&store), events.clone()),
            control: TaskControl::new(Arc::clone(&store), events.clone()),
            store,
            memory,
            events,
            config,
            pending_release: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.decision = self.decision.with_retry_policy(policy);
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Store failures are logged and retried after `store_backoff`. Must be
    /// the only engine running against this store; see
    /// [`Engine::recover_stale`].
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Error> {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_iterations = self.config.max_decision_iterations,
            "Engine started"
        );

        match self.recover_stale().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Released stale in-progress tasks"),
            Err(e) => warn!(error = %e, "Stale task recovery failed, will retry on next tick"),
        }

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            match self.tick(&shutdown).await {
                Ok(TickOutcome::Idle) => debug!("Nothing to do"),
                Ok(TickOutcome::Processed { task_id, status }) => {
                    info!(task_id = %task_id, status = %status, "Task processed");
                }
                Ok(TickOutcome::Interrupted { task_id }) => {
                    info!(task_id = %task_id, "Task interrupted by shutdown");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = self.config.store_backoff.as_secs(),
                        "Engine tick failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.store_backoff) => {}
                    }
                }
            }
        }

        if let Err(e) = self.retry_pending_release().await {
            error!(error = %e, "Release still failing at shutdown");
        }
        info!("Engine stopped");
        Ok(())
    }

    /// One pass: settle any pending release, resume answered escalations,
    /// then claim and process a task.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<TickOutcome, Error> {
        self.retry_pending_release().await?;

        let resumed = self.escalation.resume_answered().await?;
        if resumed > 0 {
            debug!(resumed, "Resumed tasks with stored replies");
        }

        let Some(task) = self.scheduler.next().await? else {
            return Ok(TickOutcome::Idle);
        };
        self.process(task, shutdown).await
    }

    /// Process a task this engine has claimed.
    async fn process(&self, mut task: Task, shutdown: &CancellationToken) -> Result<TickOutcome, Error> {
        let task_id = task.id;
        let payload = self.assembler.assemble(&task).await;
        if payload.is_degraded() {
            warn!(
                task_id = %task_id,
                memory_degraded = payload.memory_degraded,
                related_degraded = payload.related_degraded,
                "Deciding with degraded context"
            );
        }

        let decision = self.decision.decide(&payload);
        tokio::pin!(decision);

        let outcome = tokio::select! {
            outcome = &mut decision => outcome,
            _ = shutdown.cancelled() => {
                info!(
                    task_id = %task_id,
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "Shutdown requested, waiting for current decision"
                );
                match tokio::time::timeout(self.config.shutdown_grace, &mut decision).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(task_id = %task_id, "Decision did not finish in grace period, releasing task");
                        self.release_or_remember(task_id).await;
                        return Ok(TickOutcome::Interrupted { task_id });
                    }
                }
            }
        };

        match self.apply_outcome(&mut task, outcome).await {
            Ok(status) => Ok(TickOutcome::Processed { task_id, status }),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to apply outcome, releasing task");
                self.release_or_remember(task_id).await;
                Err(e)
            }
        }
    }

    /// Persist a decision outcome for an in-progress task. Returns the
    /// task's resulting status.
    pub async fn apply_outcome(&self, task: &mut Task, outcome: Outcome) -> Result<TaskStatus, Error> {
        match outcome {
            Outcome::Completed { summary } => {
                let event = TransitionEvent::Completed {
                    summary: summary.clone(),
                };
                let Some(change) = persist_transition(self.store.as_ref(), task, event).await? else {
                    return self.lost_ownership(task.id).await;
                };
                info!(task_id = %task.id, "Task completed");
                self.events.emit_change(&change, &task.title);
                self.remember_completion(task, &summary).await;
                Ok(TaskStatus::Done)
            }
            Outcome::EscalationRequested {
                decision_type,
                prompt,
            } => {
                let Some(change) = self
                    .escalation
                    .escalate_task(task, &decision_type, &prompt)
                    .await?
                else {
                    return self.lost_ownership(task.id).await;
                };
                Ok(change.to)
            }
            Outcome::Fatal { reason, detail } => {
                let event = TransitionEvent::Failed {
                    reason: reason.clone(),
                    detail: detail.clone(),
                };
                let reason_comment = Comment::agent(task.id, format!("Task failed: {reason}: {detail}"));
                let Some(change) =
                    persist_transition_with_comment(self.store.as_ref(), task, event, reason_comment)
                        .await?
                else {
                    return self.lost_ownership(task.id).await;
                };
                warn!(task_id = %task.id, reason = %reason, detail = %detail, "Task failed");
                self.events.emit_change(&change, &task.title);
                Ok(TaskStatus::Failed)
            }
            Outcome::ToolInvoked { .. } => {
                // Not a resting outcome.
                warn!(task_id = %task.id, "Intermediate outcome applied, releasing task");
                self.release(task.id).await?;
                task.status = TaskStatus::Todo;
                Ok(TaskStatus::Todo)
            }
        }
    }

    /// Someone else moved the task while we were deciding.
    async fn lost_ownership(&self, task_id: Uuid) -> Result<TaskStatus, Error> {
        let status = self
            .store
            .get(task_id)
            .await?
            .map(|t| t.status)
            .ok_or(Error::TaskNotFound { id: task_id })?;
        warn!(task_id = %task_id, status = %status, "Task changed underneath the engine, outcome dropped");
        Ok(status)
    }

    /// Write a completion summary to memory. Best-effort.
    async fn remember_completion(&self, task: &Task, summary: &str) {
        let content = format!("Completed task \"{}\": {}", task.title, summary);
        let source = format!("ai-tasker task {}", task.id);
        match tokio::time::timeout(MEMORY_SEARCH_TIMEOUT, self.memory.add(&content, &source)).await {
            Ok(Ok(())) => debug!(task_id = %task.id, "Completion summary written to memory"),
            Ok(Err(e)) => warn!(task_id = %task.id, error = %e, "Failed to write completion to memory"),
            Err(_) => warn!(task_id = %task.id, "Memory write timed out"),
        }
    }

    /// Return an in-progress task to `todo`. See [`TaskControl::release`].
    pub async fn release(&self, task_id: Uuid) -> Result<bool, Error> {
        self.control.release(task_id).await
    }

    async fn release_or_remember(&self, task_id: Uuid) {
        if let Err(e) = self.release(task_id).await {
            error!(task_id = %task_id, error = %e, "Release failed, will retry");
            *self.pending_release.lock().await = Some(task_id);
        }
    }

    async fn retry_pending_release(&self) -> Result<(), Error> {
        let Some(task_id) = self.pending_release.lock().await.take() else {
            return Ok(());
        };
        match self.release(task_id).await {
            Ok(_) => {
                info!(task_id = %task_id, "Pending release completed");
                Ok(())
            }
            Err(Error::TaskNotFound { .. }) => {
                warn!(task_id = %task_id, "Task with pending release no longer exists, dropping it");
                Ok(())
            }
            Err(e) => {
                *self.pending_release.lock().await = Some(task_id);
                Err(e)
            }
        }
    }

    /// Release tasks orphaned by a crashed process. Call before the first
    /// claim.
    ///
    /// Ownership is not recorded, so this also releases a task a second live
    /// engine is working on.
    pub async fn recover_stale(&self) -> Result<usize, Error> {
        self.control.recover_stale().await
    }

    pub async fn requeue(&self, task_id: Uuid) -> Result<bool, Error> {
        self.control.requeue(task_id).await
    }

    /// Human reply entry point. See [`EscalationHandler::on_human_comment`].
    pub async fn on_human_comment(&self, task_id: Uuid, text: &str) -> Result<ResumeOutcome, Error> {
        self.escalation.on_human_comment(task_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, MemoryError};
    use crate::llm::{FinishReason, ToolCall, ToolCompletionRequest, ToolCompletionResponse};
    use crate::memory::{Fact, NoopMemory};
    use crate::store::LibSqlBackend;
    use crate::store::testing::FlakyCommentStore;
    use crate::tasks::AuthorKind;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Always answers with the same tool call.
    struct FixedLlm(ToolCall);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }
        async fn complete_with_tools(
            &self,
            _r: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            Ok(ToolCompletionResponse {
                content: None,
                tool_calls: vec![self.0.clone()],
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::ToolUse,
                response_id: None,
            })
        }
    }

    struct RecordingMemory(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl MemoryBoundary for RecordingMemory {
        async fn search(&self, _q: &str, _limit: usize) -> Result<Vec<Fact>, MemoryError> {
            Ok(Vec::new())
        }
        async fn add(&self, content: &str, _source: &str) -> Result<(), MemoryError> {
            self.0.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }

    fn complete_call() -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "complete_task".into(),
            arguments: json!({"summary": "All done"}),
        }
    }

    async fn engine_with(llm: ToolCall, memory: Arc<dyn MemoryBoundary>) -> Engine {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        engine_on(store, llm, memory)
    }

    fn engine_on(store: Arc<dyn TaskStore>, llm: ToolCall, memory: Arc<dyn MemoryBoundary>) -> Engine {
        Engine::new(
            store,
            memory,
            Arc::new(FixedLlm(llm)),
            Arc::new(ToolRegistry::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn tick_completes_task_and_records_memory() {
        let memory = Arc::new(RecordingMemory(std::sync::Mutex::new(Vec::new())));
        let engine = engine_with(complete_call(), memory.clone()).await;
        let task = Task::new("Archive receipts");
        engine.store().create_task(&task).await.unwrap();

        let outcome = engine.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                task_id: task.id,
                status: TaskStatus::Done
            }
        );

        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("All done"));
        assert!(stored.completed_at.is_some());
        assert_eq!(memory.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idle_when_queue_empty() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let outcome = engine.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn fatal_outcome_records_reason() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let task = Task::new("Doomed");
        engine.store().create_task(&task).await.unwrap();
        assert!(engine.store().claim(task.id).await.unwrap());
        let mut task = engine.store().get(task.id).await.unwrap().unwrap();

        let status = engine
            .apply_outcome(&mut task, Outcome::fatal("tool_fatal", "send_email: revoked"))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(
            stored.last_comment().unwrap().content,
            "Task failed: tool_fatal: send_email: revoked"
        );
    }

    #[tokio::test]
    async fn escalation_outcome_parks_task() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let task = Task::new("Ask first");
        engine.store().create_task(&task).await.unwrap();
        assert!(engine.store().claim(task.id).await.unwrap());
        let mut task = engine.store().get(task.id).await.unwrap().unwrap();

        let status = engine
            .apply_outcome(
                &mut task,
                Outcome::EscalationRequested {
                    decision_type: "email_approval".into(),
                    prompt: "Send?".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::AwaitingDecision);
        assert!(task.needs_decision);

        let outcome = engine.on_human_comment(task.id, "Yes").await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Resumed);
    }

    #[tokio::test]
    async fn outcome_dropped_when_task_moved() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let task = Task::new("Contested");
        engine.store().create_task(&task).await.unwrap();
        assert!(engine.store().claim(task.id).await.unwrap());
        let mut stale = engine.store().get(task.id).await.unwrap().unwrap();
        assert!(engine.release(task.id).await.unwrap());

        let status = engine
            .apply_outcome(&mut stale, Outcome::Completed { summary: "late".into() })
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Todo);
        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert!(stored.summary.is_none());
    }

    #[tokio::test]
    async fn escalation_dropped_when_task_moved() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let task = Task::new("Contested");
        engine.store().create_task(&task).await.unwrap();
        assert!(engine.store().claim(task.id).await.unwrap());
        let mut stale = engine.store().get(task.id).await.unwrap().unwrap();
        assert!(engine.release(task.id).await.unwrap());

        let status = engine
            .apply_outcome(
                &mut stale,
                Outcome::EscalationRequested {
                    decision_type: "email_approval".into(),
                    prompt: "Send?".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Todo);

        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Todo);
        assert!(!stored.needs_decision);
        assert!(stored.comments.is_empty());
    }

    #[tokio::test]
    async fn failed_reason_write_is_not_silent() {
        let flaky = Arc::new(FlakyCommentStore::new().await);
        let engine = engine_on(flaky.clone(), complete_call(), Arc::new(NoopMemory));
        let task = Task::new("Doomed");
        engine.store().create_task(&task).await.unwrap();
        assert!(engine.store().claim(task.id).await.unwrap());
        let mut task = engine.store().get(task.id).await.unwrap().unwrap();

        flaky.fail_comments(true);
        let result = engine
            .apply_outcome(&mut task, Outcome::fatal("model_error", "boom"))
            .await;
        assert!(result.is_err());

        // No Failed task without its reason.
        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert!(stored.comments.is_empty());

        flaky.fail_comments(false);
        let status = engine
            .apply_outcome(&mut task, Outcome::fatal("model_error", "boom"))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.last_comment().unwrap().content, "Task failed: model_error: boom");
    }

    #[tokio::test]
    async fn stored_reply_resumes_before_claim() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let task = Task::new("Ask first");
        engine.store().create_task(&task).await.unwrap();
        assert!(engine.store().claim(task.id).await.unwrap());
        let mut claimed = engine.store().get(task.id).await.unwrap().unwrap();
        engine
            .apply_outcome(
                &mut claimed,
                Outcome::EscalationRequested {
                    decision_type: "email_approval".into(),
                    prompt: "Send?".into(),
                },
            )
            .await
            .unwrap();

        // Reply written straight to the store, no engine call.
        engine
            .store()
            .append_comment(&Comment::human(task.id, "Yes, send it"))
            .await
            .unwrap();

        let outcome = engine.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                task_id: task.id,
                status: TaskStatus::Done
            }
        );
        let stored = engine.store().get(task.id).await.unwrap().unwrap();
        assert!(
            stored
                .comments
                .iter()
                .any(|c| c.author == AuthorKind::Human && c.content == "Yes, send it")
        );
    }

    #[tokio::test]
    async fn pending_release_of_missing_task_is_dropped() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        *engine.pending_release.lock().await = Some(Uuid::new_v4());

        let outcome = engine.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Idle);
        assert!(engine.pending_release.lock().await.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let engine = engine_with(complete_call(), Arc::new(NoopMemory)).await;
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), engine.run(token))
            .await
            .unwrap()
            .unwrap();
    }
}
