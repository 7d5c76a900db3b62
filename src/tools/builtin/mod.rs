//! Built-in tools for memory access and task lookup.

pub mod memory;
pub mod task;

pub use memory::{MemoryAddTool, MemorySearchTool};
pub use task::ReadTaskTool;
