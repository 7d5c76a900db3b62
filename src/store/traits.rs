//! `TaskStore` trait, the single async interface the engine persists through.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::events::TaskEvent;
use crate::tasks::model::{Comment, EntityKind, EntityRef, Task, TaskStatus};
use crate::tasks::state::StatusFields;

/// Backend-agnostic store for tasks, comments, entities and events.
///
/// Status changes are compare-and-swap: every write names the status it
/// expects to replace and reports whether it won. `claim` additionally
/// refuses while any task is `in_progress`, so concurrent claimers never
/// both win.
///
/// The store does not record which process owns an `in_progress` task.
/// One engine process per database is assumed: startup recovery treats any
/// `in_progress` row as abandoned.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task together with its comments and entity links.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID, with its full comment history.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Oldest `new`/`todo` task (ties broken by id), without comments.
    async fn get_next_eligible(&self) -> Result<Option<Task>, DatabaseError>;

    /// Atomically move an eligible task to `in_progress`.
    ///
    /// Returns `false` if the task is no longer eligible or another task
    /// already holds `in_progress`.
    async fn claim(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Move an `in_progress` task back to `todo`. Returns `false` if it was
    /// not `in_progress`.
    async fn release(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Compare-and-swap status update. Returns `false` if the stored status
    /// was not `expected`.
    async fn update_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        target: TaskStatus,
        fields: &StatusFields,
    ) -> Result<bool, DatabaseError>;

    /// Compare-and-swap status update that also appends `comment`, in one
    /// transaction. On `false` neither write happened.
    async fn update_status_with_comment(
        &self,
        id: Uuid,
        expected: TaskStatus,
        target: TaskStatus,
        fields: &StatusFields,
        comment: &Comment,
    ) -> Result<bool, DatabaseError>;

    /// Tasks in a status, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// Number of tasks currently `in_progress`.
    async fn count_in_progress(&self) -> Result<usize, DatabaseError>;

    // ── Comments ────────────────────────────────────────────────────

    /// Append a comment to a task's history.
    async fn append_comment(&self, comment: &Comment) -> Result<(), DatabaseError>;

    /// Latest `limit` comments in chronological order (all when `None`).
    async fn list_comments(
        &self,
        task_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Comment>, DatabaseError>;

    // ── Entities ────────────────────────────────────────────────────

    /// Insert or refresh an entity's name and summary.
    async fn upsert_entity(&self, entity: &EntityRef) -> Result<(), DatabaseError>;

    /// Link an entity to a task. Linking twice is a no-op.
    async fn link_entity(
        &self,
        task_id: Uuid,
        entity_id: Uuid,
        kind: EntityKind,
    ) -> Result<(), DatabaseError>;

    /// Known entities linked to a task. Links to unknown entities are skipped.
    async fn related_entities(&self, task_id: Uuid) -> Result<Vec<EntityRef>, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Append an event to the persisted event log.
    async fn save_event(&self, event: &TaskEvent) -> Result<(), DatabaseError>;

    /// Events for a task in emission order.
    async fn list_events(&self, task_id: Uuid) -> Result<Vec<TaskEvent>, DatabaseError>;
}
