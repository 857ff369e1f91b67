//! Taskline — background-task execution and tracing engine.
//!
//! Runs long-lived, multi-step operations off the caller's critical path,
//! tracks each task's lifecycle to a durable record, and reconstructs
//! hierarchical execution traces for inspection.

pub mod config;
pub mod error;
pub mod store;
pub mod task;
pub mod trace;
