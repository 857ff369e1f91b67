//! Error types for the task engine.

use uuid::Uuid;

use crate::task::record::TaskStatus;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Durable record store errors.
///
/// Never retried internally; callers decide what to do when the store is
/// unavailable.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Maximum step count ({max}) exceeded")]
    MaxStepsExceeded { max: usize },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Tool {name} failed: {reason}")]
    Tool { name: String, reason: String },

    #[error("Task function failed: {0}")]
    Function(String),
}

/// Trace and span errors.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Trace {id} not found")]
    TraceNotFound { id: Uuid },

    #[error("Span {id} not found")]
    SpanNotFound { id: Uuid },

    #[error("Parent span {id} not found")]
    ParentSpanNotFound { id: Uuid },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
