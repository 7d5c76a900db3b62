//! AI Tasker: autonomous task-processing engine.
//!
//! One task at a time: claim it, gather context, let the model work through
//! tools, then complete, fail or hand it to a human.

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod memory;
pub mod store;
pub mod tasks;
pub mod tools;
