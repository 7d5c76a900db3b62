//! Store wrapper for tests that need comment writes to fail.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::{LibSqlBackend, TaskStore};
use crate::tasks::{Comment, EntityKind, EntityRef, StatusFields, Task, TaskEvent, TaskStatus};

/// In-memory store whose comment writes fail while `fail_comments` is set.
pub struct FlakyCommentStore {
    inner: LibSqlBackend,
    fail_comments: AtomicBool,
}

impl FlakyCommentStore {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_comments: AtomicBool::new(false),
        }
    }

    pub fn fail_comments(&self, fail: bool) {
        self.fail_comments.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("comments: disk I/O error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FlakyCommentStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.inner.create_task(task).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get(id).await
    }

    async fn get_next_eligible(&self) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_next_eligible().await
    }

    async fn claim(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.claim(id).await
    }

    async fn release(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.release(id).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        target: TaskStatus,
        fields: &StatusFields,
    ) -> Result<bool, DatabaseError> {
        self.inner.update_status(id, expected, target, fields).await
    }

    async fn update_status_with_comment(
        &self,
        id: Uuid,
        expected: TaskStatus,
        target: TaskStatus,
        fields: &StatusFields,
        comment: &Comment,
    ) -> Result<bool, DatabaseError> {
        self.check()?;
        self.inner
            .update_status_with_comment(id, expected, target, fields, comment)
            .await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_by_status(status).await
    }

    async fn count_in_progress(&self) -> Result<usize, DatabaseError> {
        self.inner.count_in_progress().await
    }

    async fn append_comment(&self, comment: &Comment) -> Result<(), DatabaseError> {
        self.check()?;
        self.inner.append_comment(comment).await
    }

    async fn list_comments(
        &self,
        task_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Comment>, DatabaseError> {
        self.inner.list_comments(task_id, limit).await
    }

    async fn upsert_entity(&self, entity: &EntityRef) -> Result<(), DatabaseError> {
        self.inner.upsert_entity(entity).await
    }

    async fn link_entity(
        &self,
        task_id: Uuid,
        entity_id: Uuid,
        kind: EntityKind,
    ) -> Result<(), DatabaseError> {
        self.inner.link_entity(task_id, entity_id, kind).await
    }

    async fn related_entities(&self, task_id: Uuid) -> Result<Vec<EntityRef>, DatabaseError> {
        self.inner.related_entities(task_id).await
    }

    async fn save_event(&self, event: &TaskEvent) -> Result<(), DatabaseError> {
        self.inner.save_event(event).await
    }

    async fn list_events(&self, task_id: Uuid) -> Result<Vec<TaskEvent>, DatabaseError> {
        self.inner.list_events(task_id).await
    }
}
