//! In-memory `TaskStore` backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::store::traits::{TaskFilter, TaskStore};
use crate::task::record::TaskRecord;

/// Task-record store backed by a process-local map.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Check if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        self.tasks
            .write()
            .await
            .insert(record.task_id, record.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StorageError> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn update_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&record.task_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::Query(format!(
                "task {} does not exist",
                record.task_id
            ))),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StorageError> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| {
                filter
                    .session_id
                    .as_ref()
                    .is_none_or(|s| &t.session_id == s)
            })
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.created_at.cmp(&a.created_at))
        });
        matched.truncate(filter.limit);
        Ok(matched)
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.tasks.write().await.remove(&task_id).is_some())
    }

    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|done| done < cutoff))
        });
        Ok(before - tasks.len())
    }
}
