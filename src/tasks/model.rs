//! Task data model: tasks, comments, and related entity references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Just created, not yet seen by the engine.
    New,
    /// Actionable and queued.
    Todo,
    /// Exclusively owned by the engine. At most one task system-wide.
    InProgress,
    /// Suspended until a human replies.
    AwaitingDecision,
    /// Terminal success.
    Done,
    /// Terminal error (re-queueable by an explicit action).
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        Self::New,
        Self::Todo,
        Self::InProgress,
        Self::AwaitingDecision,
        Self::Done,
        Self::Failed,
    ];

    /// Storage / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::AwaitingDecision => "awaiting_decision",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who wrote a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    Human,
    Agent,
}

impl AuthorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// A task-scoped comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub author: AuthorKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    /// A comment written by a person.
    pub fn human(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(task_id, AuthorKind::Human, content)
    }

    /// A comment written by the engine.
    pub fn agent(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(task_id, AuthorKind::Agent, content)
    }

    fn new(task_id: Uuid, author: AuthorKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            author,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Kind of an externally-owned entity a task can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Project,
    Chat,
    Artifact,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Project => "project",
            Self::Chat => "chat",
            Self::Artifact => "artifact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(Self::Person),
            "project" => Some(Self::Project),
            "chat" => Some(Self::Chat),
            "artifact" => Some(Self::Artifact),
            _ => None,
        }
    }
}

/// Read-only view of a person, project, chat, or artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: Uuid,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl EntityRef {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A unit of work tracked through the lifecycle state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// Short title.
    pub title: String,
    /// Optional free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Comment history, oldest first.
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Summary written when the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// True exactly while the task awaits a human decision.
    pub needs_decision: bool,
    /// Kind of decision requested (e.g. `email_approval`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_type: Option<String>,
    /// Free-form labels, also used to build memory queries.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub people: Vec<Uuid>,
    #[serde(default)]
    pub projects: Vec<Uuid>,
    #[serde(default)]
    pub chats: Vec<Uuid>,
    #[serde(default)]
    pub artifacts: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once, on entering `Done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task in the `New` status.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            comments: Vec::new(),
            summary: None,
            status: TaskStatus::New,
            needs_decision: false,
            decision_type: None,
            tags: Vec::new(),
            people: Vec::new(),
            projects: Vec::new(),
            chats: Vec::new(),
            artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder: add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder: override the creation time (ingestion replays, tests).
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Builder: link a related entity by kind.
    pub fn with_related(mut self, entity: &EntityRef) -> Self {
        self.related_mut(entity.kind).push(entity.id);
        self
    }

    /// The relationship set for an entity kind.
    pub fn related(&self, kind: EntityKind) -> &[Uuid] {
        match kind {
            EntityKind::Person => &self.people,
            EntityKind::Project => &self.projects,
            EntityKind::Chat => &self.chats,
            EntityKind::Artifact => &self.artifacts,
        }
    }

    fn related_mut(&mut self, kind: EntityKind) -> &mut Vec<Uuid> {
        match kind {
            EntityKind::Person => &mut self.people,
            EntityKind::Project => &mut self.projects,
            EntityKind::Chat => &mut self.chats,
            EntityKind::Artifact => &mut self.artifacts,
        }
    }

    /// The most recent comment, if any.
    pub fn last_comment(&self) -> Option<&Comment> {
        self.comments.last()
    }
}
