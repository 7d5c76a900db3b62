//! Tool abstraction for engine capabilities.

pub mod builtin;
pub mod gateway;
pub mod registry;
pub mod tool;

pub use gateway::{GatewayError, ToolFailureKind, ToolGateway};
pub use registry::ToolRegistry;
pub use tool::*;

use std::sync::Arc;

use crate::memory::MemoryBoundary;
use crate::store::TaskStore;

impl ToolRegistry {
    /// Register the memory tools over a memory backend.
    pub fn register_memory_tools(&self, memory: Arc<dyn MemoryBoundary>) {
        self.register_sync(Arc::new(builtin::MemorySearchTool::new(Arc::clone(&memory))));
        self.register_sync(Arc::new(builtin::MemoryAddTool::new(memory)));
    }

    /// Register the task lookup tool.
    pub fn register_task_tools(&self, store: Arc<dyn TaskStore>) {
        self.register_sync(Arc::new(builtin::ReadTaskTool::new(store)));
    }
}
