//! Single-flight scheduler: picks the next task and claims it exclusively.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, TransitionError};
use crate::store::TaskStore;
use crate::tasks::{EventEmitter, Task, TransitionEvent};

/// Re-selections after a lost claim before giving up until the next tick.
pub const MAX_CLAIM_ATTEMPTS: usize = 3;

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    events: EventEmitter,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, events: EventEmitter) -> Self {
        Self { store, events }
    }

    /// Claim the oldest eligible task.
    ///
    /// Returns `None` while any task is `in_progress` or when nothing is
    /// eligible. The returned task is already `in_progress`.
    pub async fn next(&self) -> Result<Option<Task>, Error> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            if self.store.count_in_progress().await? > 0 {
                debug!("A task is already in progress, not claiming");
                return Ok(None);
            }

            let Some(mut task) = self.store.get_next_eligible().await? else {
                return Ok(None);
            };

            if self.store.claim(task.id).await? {
                let change = task.apply(TransitionEvent::Claimed, Utc::now())?;
                info!(task_id = %task.id, title = %task.title, from = %change.from, "Claimed task");
                self.events.emit_change(&change, &task.title);
                return Ok(Some(task));
            }

            let violation = TransitionError::ConcurrencyViolation {
                id: task.id,
                reason: "claim lost to a concurrent writer".to_string(),
            };
            debug!(attempt, error = %violation, "Re-selecting after lost claim");
        }

        Ok(None)
    }
}
