//! `TaskStore` trait — single async interface for task-record persistence.
//!
//! The engine never talks to a concrete database; the host wires in whatever
//! backend it uses. [`crate::store::MemoryStore`] is the in-process
//! implementation the engine ships with.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::task::record::{TaskRecord, TaskStatus};

/// Filter for listing task records.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    /// Restrict to one session.
    pub session_id: Option<String>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
    /// Maximum number of records returned.
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            session_id: None,
            status: None,
            limit: 50,
        }
    }
}

/// Backend-agnostic store for durable task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record.
    async fn insert_task(&self, record: &TaskRecord) -> Result<(), StorageError>;

    /// Get a record by task ID.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StorageError>;

    /// Write back a full record.
    async fn update_task(&self, record: &TaskRecord) -> Result<(), StorageError>;

    /// List records matching a filter, ordered by priority ascending then
    /// creation time descending.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StorageError>;

    /// Delete a record. Returns false if it did not exist.
    async fn delete_task(&self, task_id: Uuid) -> Result<bool, StorageError>;

    /// Bulk-delete terminal records that completed before the cutoff.
    /// Returns the number of records deleted.
    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StorageError>;
}
