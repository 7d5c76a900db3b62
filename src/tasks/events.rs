//! Lifecycle event stream.
//!
//! Every status change is published once as a [`TaskEvent`] on a broadcast
//! channel. Observers (UI bridges, audit logs) subscribe; the emitter never
//! waits on them. When a store is attached, events are also persisted in the
//! background for replay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::TaskStore;
use crate::tasks::state::{StatusChange, TransitionEvent};

/// Buffered events per subscriber before lagging receivers drop old ones.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A published lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Uuid,
    pub data: Value,
    pub source: String,
}

impl TaskEvent {
    /// Status after the transition, when the event carries one.
    pub fn status(&self) -> Option<&str> {
        self.data.get("status").and_then(Value::as_str)
    }

    /// Status before the transition, when the event carries one.
    pub fn previous_status(&self) -> Option<&str> {
        self.data.get("previous_status").and_then(Value::as_str)
    }
}

/// Fan-out publisher for [`TaskEvent`]s.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<TaskEvent>,
    source: String,
    store: Option<Arc<dyn TaskStore>>,
}

impl EventEmitter {
    pub fn new(source: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            source: source.into(),
            store: None,
        }
    }

    /// Persist every emitted event to the store's event log.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Fire-and-forget.
    pub fn emit(&self, event_type: &str, task_id: Uuid, data: Value) -> TaskEvent {
        let event = TaskEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            task_id,
            data,
            source: self.source.clone(),
        };

        // No receivers is fine.
        let _ = self.tx.send(event.clone());

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let persisted = event.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_event(&persisted).await {
                    tracing::warn!(
                        task_id = %persisted.task_id,
                        event_type = %persisted.event_type,
                        error = %e,
                        "Failed to persist task event"
                    );
                }
            });
        }

        tracing::debug!(task_id = %task_id, event_type, "Emitted task event");
        event
    }

    /// Publish the event for an applied status change.
    pub fn emit_change(&self, change: &StatusChange, title: &str) -> TaskEvent {
        let mut data = json!({
            "status": change.to,
            "previous_status": change.from,
            "title": title,
        });
        match &change.event {
            TransitionEvent::Escalated {
                decision_type,
                prompt,
            } => {
                data["decision_type"] = json!(decision_type);
                data["prompt"] = json!(prompt);
            }
            TransitionEvent::Completed { summary } => {
                data["summary"] = json!(summary);
            }
            TransitionEvent::Failed { reason, detail } => {
                data["reason"] = json!(reason);
                data["detail"] = json!(detail);
            }
            _ => {}
        }
        self.emit(change.event.event_type(), change.task_id, data)
    }
}
