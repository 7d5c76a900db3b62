//! Persistence layer: libSQL-backed storage for tasks, comments, entities and events.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use libsql_backend::LibSqlBackend;
pub use traits::TaskStore;
