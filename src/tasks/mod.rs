//! Tasks: data model, lifecycle state machine, and event stream.

pub mod events;
pub mod model;
pub mod state;

pub use events::{EventEmitter, TaskEvent};
pub use model::{AuthorKind, Comment, EntityKind, EntityRef, Task, TaskStatus};
pub use state::{StatusChange, StatusFields, TransitionEvent, transition};
