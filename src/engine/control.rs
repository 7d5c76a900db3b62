//! Operator-side lifecycle edges: release, crash recovery, requeue.
//!
//! These need only the store and the event stream, so the CLI can use them
//! without a model configured.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::engine::persist_transition;
use crate::error::Error;
use crate::store::TaskStore;
use crate::tasks::{EventEmitter, TaskStatus, TransitionEvent};

#[derive(Clone)]
pub struct TaskControl {
    store: Arc<dyn TaskStore>,
    events: EventEmitter,
}

impl TaskControl {
    pub fn new(store: Arc<dyn TaskStore>, events: EventEmitter) -> Self {
        Self { store, events }
    }

    /// Return an in-progress task to `todo`. Returns `false` if it was not
    /// in progress.
    pub async fn release(&self, task_id: Uuid) -> Result<bool, Error> {
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(Error::TaskNotFound { id: task_id })?;
        if task.status != TaskStatus::InProgress {
            return Ok(false);
        }
        if !self.store.release(task_id).await? {
            return Ok(false);
        }
        let change = task.apply(TransitionEvent::Released, Utc::now())?;
        info!(task_id = %task_id, "Released task");
        self.events.emit_change(&change, &task.title);
        Ok(true)
    }

    /// Release every task left `in_progress`, e.g. by a crashed process.
    pub async fn recover_stale(&self) -> Result<usize, Error> {
        let stale = self.store.list_by_status(TaskStatus::InProgress).await?;
        let mut released = 0;
        for task in stale {
            if self.release(task.id).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Put a failed task back in the queue.
    pub async fn requeue(&self, task_id: Uuid) -> Result<bool, Error> {
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(Error::TaskNotFound { id: task_id })?;
        let Some(change) =
            persist_transition(self.store.as_ref(), &mut task, TransitionEvent::Requeued).await?
        else {
            return Ok(false);
        };
        info!(task_id = %task_id, "Requeued failed task");
        self.events.emit_change(&change, &task.title);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransitionError;
    use crate::store::LibSqlBackend;
    use crate::tasks::{StatusFields, Task};

    async fn setup() -> (Arc<dyn TaskStore>, TaskControl, EventEmitter) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let events = EventEmitter::new("test");
        let control = TaskControl::new(Arc::clone(&store), events.clone());
        (store, control, events)
    }

    #[tokio::test]
    async fn recover_stale_releases_orphans() {
        let (store, control, events) = setup().await;
        let task = Task::new("Orphan");
        store.create_task(&task).await.unwrap();
        assert!(store.claim(task.id).await.unwrap());

        let mut rx = events.subscribe();
        assert_eq!(control.recover_stale().await.unwrap(), 1);
        assert_eq!(store.count_in_progress().await.unwrap(), 0);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task_released");
        assert_eq!(event.status(), Some("todo"));

        assert!(!control.release(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn release_unknown_task() {
        let (_, control, _) = setup().await;
        assert!(matches!(
            control.release(Uuid::new_v4()).await,
            Err(Error::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn requeue_only_from_failed() {
        let (store, control, _) = setup().await;
        let task = Task::new("Retry me");
        store.create_task(&task).await.unwrap();

        assert!(matches!(
            control.requeue(task.id).await,
            Err(Error::Transition(TransitionError::InvalidTransition { .. }))
        ));

        assert!(store.claim(task.id).await.unwrap());
        assert!(
            store
                .update_status(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                    &StatusFields::default()
                )
                .await
                .unwrap()
        );

        assert!(control.requeue(task.id).await.unwrap());
        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Todo);
    }
}
