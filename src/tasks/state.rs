//! Task lifecycle state machine.
//!
//! Pure logic: the legal transition table plus the bookkeeping a transition
//! implies for decision metadata and timestamps. Persistence happens in the
//! store, which applies the same [`StatusFields`] under a compare-and-swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;
use crate::tasks::model::{Task, TaskStatus};

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Pickup
            (New, InProgress) | (Todo, InProgress) |
            // From InProgress
            (InProgress, AwaitingDecision) | (InProgress, Done) |
            (InProgress, Failed) | (InProgress, Todo) |
            // Human reply
            (AwaitingDecision, Todo) |
            // Explicit re-queue
            (Failed, Todo)
        )
    }

    /// `Done` is final. `Failed` only leaves through an explicit re-queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the scheduler may pick a task in this status.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::New | Self::Todo)
    }
}

/// Something that happened to a task and may move it to another status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransitionEvent {
    /// The scheduler took exclusive ownership.
    Claimed,
    /// The decision loop needs a human.
    Escalated {
        decision_type: String,
        prompt: String,
    },
    /// The decision loop finished the work.
    Completed { summary: String },
    /// The decision loop gave up.
    Failed { reason: String, detail: String },
    /// A human replied to a pending decision.
    HumanCommented,
    /// An operator put a failed task back in the queue.
    Requeued,
    /// Ownership was dropped without an outcome (shutdown, crash recovery).
    Released,
}

impl TransitionEvent {
    /// Status this event leads to.
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Claimed => TaskStatus::InProgress,
            Self::Escalated { .. } => TaskStatus::AwaitingDecision,
            Self::Completed { .. } => TaskStatus::Done,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::HumanCommented | Self::Requeued | Self::Released => TaskStatus::Todo,
        }
    }

    /// Statuses this event may fire from.
    fn accepts(&self, from: TaskStatus) -> bool {
        match self {
            Self::Claimed => from.is_eligible(),
            Self::Escalated { .. } | Self::Completed { .. } | Self::Failed { .. } | Self::Released => {
                from == TaskStatus::InProgress
            }
            Self::HumanCommented => from == TaskStatus::AwaitingDecision,
            Self::Requeued => from == TaskStatus::Failed,
        }
    }

    /// Name used on the event stream.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claimed => "task_claimed",
            Self::Escalated { .. } => "task_escalated",
            Self::Completed { .. } => "task_completed",
            Self::Failed { .. } => "task_failed",
            Self::HumanCommented => "task_resumed",
            Self::Requeued => "task_requeued",
            Self::Released => "task_released",
        }
    }

    /// Column values the store writes together with the new status.
    pub fn fields(&self, at: DateTime<Utc>) -> StatusFields {
        let mut fields = StatusFields {
            updated_at: at,
            ..StatusFields::default()
        };
        match self {
            Self::Escalated { decision_type, .. } => {
                fields.needs_decision = true;
                fields.decision_type = Some(decision_type.clone());
            }
            Self::Completed { summary } => {
                fields.summary = Some(summary.clone());
                fields.completed_at = Some(at);
            }
            _ => {}
        }
        fields
    }
}

/// Fields written alongside a status change.
///
/// `needs_decision` and `decision_type` are always written, so they cannot
/// drift from the status. `summary` and `completed_at` only fill in, they
/// never overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFields {
    pub needs_decision: bool,
    pub decision_type: Option<String>,
    pub summary: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusFields {
    fn default() -> Self {
        Self {
            needs_decision: false,
            decision_type: None,
            summary: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Validate a transition without touching any task.
pub fn transition(
    task_id: Uuid,
    from: TaskStatus,
    event: &TransitionEvent,
) -> Result<TaskStatus, TransitionError> {
    let to = event.target();
    if event.accepts(from) && from.can_transition_to(to) {
        Ok(to)
    } else {
        Err(TransitionError::InvalidTransition {
            id: task_id,
            from,
            to,
        })
    }
}

/// Record of an applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub event: TransitionEvent,
    pub timestamp: DateTime<Utc>,
}

impl Task {
    /// Apply an event in memory. On error the task is left untouched.
    pub fn apply(
        &mut self,
        event: TransitionEvent,
        at: DateTime<Utc>,
    ) -> Result<StatusChange, TransitionError> {
        let from = self.status;
        let to = transition(self.id, from, &event)?;
        let fields = event.fields(at);

        self.status = to;
        self.needs_decision = fields.needs_decision;
        self.decision_type = fields.decision_type;
        if fields.summary.is_some() {
            self.summary = fields.summary;
        }
        if self.completed_at.is_none() {
            self.completed_at = fields.completed_at;
        }
        self.updated_at = fields.updated_at;

        Ok(StatusChange {
            task_id: self.id,
            from,
            to,
            event,
            timestamp: at,
        })
    }
}
