//! Task manager — durable front door for task records and their running
//! units.
//!
//! The manager owns the map of task-id → scheduled-unit handle. Cancellation
//! is two-phase: `cancel_task` only fires the unit's token; the unit itself
//! observes it at its next suspension point and persists the terminal
//! record. The canceller never writes the record.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, TaskError};
use crate::store::{TaskFilter, TaskStore};
use crate::task::record::{NewTask, TaskRecord, TaskStatus};

/// Fixed error message recorded for cancelled tasks.
pub const CANCELLED_MESSAGE: &str = "Task cancelled";

/// A tracked scheduled unit.
pub(crate) struct RunningUnit {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) cancel: CancellationToken,
}

/// Manages durable task records and their running units.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    running: Arc<RwLock<HashMap<Uuid, RunningUnit>>>,
}

impl TaskManager {
    /// Create a new manager on top of an injected store.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Create a pending record with a fresh ID.
    ///
    /// A storage failure propagates: no record exists yet to mark failed.
    pub async fn create_task(&self, new: NewTask) -> Result<Uuid, Error> {
        let task_id = Uuid::new_v4();
        self.create_task_with_id(task_id, new).await?;
        Ok(task_id)
    }

    /// Create a pending record under a caller-chosen ID.
    pub async fn create_task_with_id(&self, task_id: Uuid, new: NewTask) -> Result<(), Error> {
        let record = TaskRecord::new(task_id, new);
        self.store.insert_task(&record).await?;
        tracing::debug!(task_id = %task_id, "created task record");
        Ok(())
    }

    /// Transition a record to running and schedule its work as a tracked
    /// fire-and-forget unit.
    ///
    /// Returns false if the record is unknown. A record that is not pending
    /// yields an `InvalidTransition` error.
    pub async fn start_task<F>(&self, task_id: Uuid, work: F) -> Result<bool, Error>
    where
        F: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        if !self.mark_running(task_id).await? {
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let unit_cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);

        // Hold the map lock across the spawn so the unit cannot remove
        // itself before it has been inserted.
        let mut units = self.running.write().await;
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = unit_cancel.cancelled() => Err(TaskError::Cancelled),
                out = work => out,
            };
            persist_outcome(store.as_ref(), task_id, outcome).await;
            running.write().await.remove(&task_id);
        });
        units.insert(task_id, RunningUnit { handle, cancel });

        tracing::debug!(task_id = %task_id, "scheduled task unit");
        Ok(true)
    }

    /// Transition a pending record to running.
    ///
    /// Returns false if the record is unknown.
    pub async fn mark_running(&self, task_id: Uuid) -> Result<bool, Error> {
        let Some(mut record) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        record.transition_to(TaskStatus::Running).map_err(Error::Task)?;
        self.store.update_task(&record).await?;
        Ok(true)
    }

    /// Persist a successful completion.
    ///
    /// Returns false if the record is unknown.
    pub async fn complete_task(&self, task_id: Uuid, result: Value) -> Result<bool, Error> {
        let Some(mut record) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        record.complete(result).map_err(Error::Task)?;
        self.store.update_task(&record).await?;
        Ok(true)
    }

    /// Persist a failure with its error message.
    ///
    /// Returns false if the record is unknown.
    pub async fn fail_task(&self, task_id: Uuid, error: &str) -> Result<bool, Error> {
        let Some(mut record) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        record.fail(error).map_err(Error::Task)?;
        self.store.update_task(&record).await?;
        Ok(true)
    }

    /// Get a task record by ID.
    pub async fn get_task_status(&self, task_id: Uuid) -> Result<Option<TaskRecord>, Error> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// List task records, ordered by priority then recency.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, Error> {
        Ok(self.store.list_tasks(filter).await?)
    }

    /// Request cancellation of a tracked unit and wait for it to settle.
    ///
    /// The unit observes the token at its next suspension point and persists
    /// the failed record itself. Returns false when no unit is tracked for
    /// the ID — even if the record currently reads running.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let unit = self.running.write().await.remove(&task_id);
        let Some(unit) = unit else {
            return false;
        };

        unit.cancel.cancel();
        if let Err(err) = unit.handle.await {
            tracing::warn!(task_id = %task_id, error = %err, "cancelled unit panicked");
        }
        tracing::info!(task_id = %task_id, "cancelled task");
        true
    }

    /// Delete a record. Returns false if it did not exist.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<bool, Error> {
        Ok(self.store.delete_task(task_id).await?)
    }

    /// Bulk-delete terminal records older than `days` days.
    pub async fn cleanup_completed_tasks(&self, days: i64) -> Result<usize, Error> {
        let cutoff = Utc::now() - Duration::days(days);
        Ok(self.store.delete_terminal_older_than(cutoff).await?)
    }

    /// IDs of currently tracked units.
    pub async fn running_tasks(&self) -> Vec<Uuid> {
        self.running.read().await.keys().copied().collect()
    }

    /// Check if a unit is tracked for the ID.
    pub async fn is_running(&self, task_id: Uuid) -> bool {
        self.running.read().await.contains_key(&task_id)
    }

    /// Cancel all tracked units and wait for them to settle.
    pub async fn shutdown(&self) {
        let units: Vec<(Uuid, RunningUnit)> = self.running.write().await.drain().collect();
        for (task_id, unit) in units {
            unit.cancel.cancel();
            if let Err(err) = unit.handle.await {
                tracing::warn!(task_id = %task_id, error = %err, "unit panicked during shutdown");
            }
        }
        tracing::info!("task manager shut down");
    }
}

/// Persist a unit's outcome to its record. Runs inside the unit itself;
/// storage failures here are logged, not raised.
async fn persist_outcome(store: &dyn TaskStore, task_id: Uuid, outcome: Result<Value, TaskError>) {
    let written = async {
        let Some(mut record) = store.get_task(task_id).await? else {
            tracing::warn!(task_id = %task_id, "record vanished before terminal update");
            return Ok::<(), Error>(());
        };
        match outcome {
            Ok(value) => record.complete(value).map_err(Error::Task)?,
            Err(err) => record.fail(err.to_string()).map_err(Error::Task)?,
        }
        store.update_task(&record).await?;
        Ok(())
    }
    .await;

    if let Err(err) = written {
        tracing::warn!(task_id = %task_id, error = %err, "failed to persist task outcome");
    }
}
