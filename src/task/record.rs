//! Durable task records and their status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::DEFAULT_PRIORITY;
use crate::error::TaskError;

/// Status of a durable task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is created but not yet started.
    Pending,
    /// Task is executing.
    Running,
    /// Task finished successfully.
    Completed,
    /// Task failed or was cancelled.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Payload for creating a new task record.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Session the task belongs to.
    pub session_id: String,
    /// Tool that originated the task.
    pub tool_name: String,
    /// Free-form task type tag.
    pub task_type: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque parameters payload.
    pub parameters: Value,
    /// Priority (lower sorts first).
    pub priority: i32,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            tool_name: String::new(),
            task_type: String::new(),
            description: String::new(),
            parameters: Value::Null,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// A durable task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID.
    pub task_id: Uuid,
    /// Session the task belongs to.
    pub session_id: String,
    /// Tool that originated the task.
    pub tool_name: String,
    /// Free-form task type tag.
    pub task_type: String,
    /// Current status.
    pub status: TaskStatus,
    /// Human-readable description.
    pub description: String,
    /// Opaque parameters payload.
    pub parameters: Value,
    /// Opaque result payload, set once on completion.
    pub result: Option<Value>,
    /// Error message if the task failed.
    pub error_message: Option<String>,
    /// Priority (lower sorts first).
    pub priority: i32,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a new pending record.
    pub fn new(task_id: Uuid, new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            session_id: new.session_id,
            tool_name: new.tool_name,
            task_type: new.task_type,
            status: TaskStatus::Pending,
            description: new.description,
            parameters: new.parameters,
            result: None,
            error_message: None,
            priority: new.priority,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Transition to a new status, updating timestamps.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.task_id,
                from: self.status,
                to: target,
            });
        }

        self.status = target;
        self.updated_at = Utc::now();
        if target.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Mark the task completed with its result payload.
    pub fn complete(&mut self, result: Value) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Mark the task failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }
}
