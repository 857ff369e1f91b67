//! Task runner — wraps a task function with registration, context creation,
//! and foreground/background execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, TaskError};
use crate::store::TaskFilter;
use crate::task::agent::{AgentTask, TurnProvider};
use crate::task::chain::{ChainStep, ToolChain};
use crate::task::context::TaskContext;
use crate::task::manager::{CANCELLED_MESSAGE, RunningUnit, TaskManager};
use crate::task::record::{NewTask, TaskRecord};

/// The work a task performs, supplied by the caller.
///
/// The engine is agnostic to what the function does; it only provides the
/// context the function records its steps and tool calls on.
#[async_trait]
pub trait TaskFn: Send + Sync {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value, TaskError>;
}

/// Parameters for one task run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Session the run belongs to.
    pub session_id: String,
    /// Free-form task type tag.
    pub task_type: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque parameters payload, recorded on the context metadata.
    pub parameters: Value,
    /// Step bound for the run's context.
    pub max_steps: usize,
    /// Run as a background unit instead of awaiting in place.
    pub background: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            task_type: "complex_task".to_string(),
            description: String::new(),
            parameters: Value::Null,
            max_steps: crate::config::DEFAULT_MAX_STEPS,
            background: false,
        }
    }
}

/// Result of a finished task run.
#[derive(Debug)]
pub struct TaskRunResult {
    pub task_id: Uuid,
    pub success: bool,
    pub final_output: Option<Value>,
    pub error: Option<String>,
    /// The run's context, available for inspection and tracing.
    pub context: TaskContext,
    pub total_steps: usize,
    pub total_tool_calls: usize,
    pub duration_ms: i64,
}

/// What `run_task` hands back: a finished result in foreground mode, or the
/// task ID of a scheduled background unit.
#[derive(Debug)]
pub enum RunOutcome {
    Finished(Box<TaskRunResult>),
    Scheduled(Uuid),
}

impl RunOutcome {
    /// The task ID, in either mode.
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Finished(result) => result.task_id,
            Self::Scheduled(task_id) => *task_id,
        }
    }

    /// The finished result, if the run was foreground.
    pub fn into_result(self) -> Option<Box<TaskRunResult>> {
        match self {
            Self::Finished(result) => Some(result),
            Self::Scheduled(_) => None,
        }
    }
}

/// Parameters for an agent-loop run.
#[derive(Debug, Clone)]
pub struct AgentRunRequest {
    pub session_id: String,
    pub max_turns: usize,
    pub background: bool,
}

impl Default for AgentRunRequest {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            max_turns: crate::config::DEFAULT_MAX_TURNS,
            background: false,
        }
    }
}

/// Parameters for a tool-chain run.
#[derive(Debug, Clone)]
pub struct ChainRunRequest {
    pub session_id: String,
    pub description: String,
    pub background: bool,
}

impl Default for ChainRunRequest {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            description: "Tool chain execution".to_string(),
            background: false,
        }
    }
}

/// Runs task functions against fresh contexts, in the foreground or as
/// tracked background units.
pub struct TaskRunner {
    manager: Option<Arc<TaskManager>>,
    config: EngineConfig,
    running: Arc<RwLock<HashMap<Uuid, RunningUnit>>>,
}

impl TaskRunner {
    /// Create a runner. Without a manager, runs are not persisted.
    pub fn new(manager: Option<Arc<TaskManager>>) -> Self {
        Self::with_config(manager, EngineConfig::default())
    }

    /// Create a runner with an explicit configuration.
    pub fn with_config(manager: Option<Arc<TaskManager>>, config: EngineConfig) -> Self {
        Self {
            manager,
            config,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run a task function.
    ///
    /// Foreground runs await execution and return the finished result — a
    /// failing task function surfaces there as `success: false`, never as an
    /// error. Background runs return the task ID immediately and persist
    /// their outcome through the manager.
    pub async fn run_task(
        &self,
        task: Arc<dyn TaskFn>,
        request: RunRequest,
    ) -> Result<RunOutcome, Error> {
        let task_id = Uuid::new_v4();

        if let Some(manager) = &self.manager {
            manager
                .create_task_with_id(
                    task_id,
                    NewTask {
                        session_id: request.session_id.clone(),
                        tool_name: "task_runner".to_string(),
                        task_type: request.task_type.clone(),
                        description: request.description.clone(),
                        parameters: request.parameters.clone(),
                        priority: self.config.default_priority,
                    },
                )
                .await?;
        }

        let metadata = json!({
            "task_type": request.task_type,
            "description": request.description,
            "parameters": request.parameters,
        });
        let context = TaskContext::new(task_id, request.session_id, request.max_steps, metadata);

        if !request.background {
            if let Some(manager) = &self.manager {
                manager.mark_running(task_id).await?;
            }
            let result = execute_task(self.manager.clone(), task_id, task, context).await?;
            return Ok(RunOutcome::Finished(Box::new(result)));
        }

        let cancel = CancellationToken::new();
        let unit_cancel = cancel.clone();
        let manager = self.manager.clone();
        let running = Arc::clone(&self.running);

        // Hold the map lock across the spawn so the unit cannot remove
        // itself before it has been inserted.
        let mut units = self.running.write().await;
        let handle = tokio::spawn(async move {
            // Reach the running state before the cancellable section so a
            // cancellation always finds a record it can fail.
            let marked = match &manager {
                Some(manager) => manager.mark_running(task_id).await,
                None => Ok(true),
            };
            match marked {
                Ok(_) => {
                    tokio::select! {
                        biased;
                        _ = unit_cancel.cancelled() => {
                            if let Some(manager) = &manager {
                                if let Err(err) =
                                    manager.fail_task(task_id, CANCELLED_MESSAGE).await
                                {
                                    tracing::warn!(
                                        task_id = %task_id,
                                        error = %err,
                                        "failed to persist cancellation"
                                    );
                                }
                            }
                        }
                        result = execute_task(manager.clone(), task_id, task, context) => {
                            if let Err(err) = result {
                                tracing::warn!(
                                    task_id = %task_id,
                                    error = %err,
                                    "background task persistence failed"
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        task_id = %task_id,
                        error = %err,
                        "could not mark background task running"
                    );
                }
            }
            // The handle is always released, whatever the outcome was.
            running.write().await.remove(&task_id);
        });
        units.insert(task_id, RunningUnit { handle, cancel });

        tracing::debug!(task_id = %task_id, "scheduled background task");
        Ok(RunOutcome::Scheduled(task_id))
    }

    /// Run a turn-taking agent loop as a task.
    ///
    /// One step is recorded per turn and one tool call per invocation the
    /// provider reports; the loop stops when the provider signals completion
    /// or the turns are exhausted.
    pub async fn run_agent_task(
        &self,
        provider: Arc<dyn TurnProvider>,
        input: &str,
        request: AgentRunRequest,
    ) -> Result<RunOutcome, Error> {
        let max_turns = if request.max_turns == 0 {
            self.config.default_max_turns
        } else {
            request.max_turns
        };
        let preview: String = input.chars().take(100).collect();
        let task = Arc::new(AgentTask::new(provider, input, max_turns));

        self.run_task(
            task,
            RunRequest {
                session_id: request.session_id,
                task_type: "agent_task".to_string(),
                description: format!("Agent task: {preview}"),
                parameters: json!({"input": input, "max_turns": max_turns}),
                // Each turn may record several steps.
                max_steps: max_turns * 5,
                background: request.background,
            },
        )
        .await
    }

    /// Run an ordered tool chain as a task.
    ///
    /// Each entry executes as its own step and tool call, strictly in list
    /// order; the first failure aborts the chain.
    pub async fn run_tool_chain(
        &self,
        steps: Vec<ChainStep>,
        request: ChainRunRequest,
    ) -> Result<RunOutcome, Error> {
        let parameters = json!({"tools_count": steps.len()});
        let task = Arc::new(ToolChain::new(steps));

        self.run_task(
            task,
            RunRequest {
                session_id: request.session_id,
                task_type: "tool_chain".to_string(),
                description: request.description,
                parameters,
                max_steps: self.config.default_max_steps,
                background: request.background,
            },
        )
        .await
    }

    /// Get a task record through the manager, if one is attached.
    pub async fn get_task_status(&self, task_id: Uuid) -> Result<Option<TaskRecord>, Error> {
        match &self.manager {
            Some(manager) => manager.get_task_status(task_id).await,
            None => Ok(None),
        }
    }

    /// List task records through the manager, if one is attached.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, Error> {
        match &self.manager {
            Some(manager) => manager.list_tasks(filter).await,
            None => Ok(Vec::new()),
        }
    }

    /// Cancel a task: the runner's own background unit if one is tracked,
    /// falling back to the manager's tracking otherwise.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let unit = self.running.write().await.remove(&task_id);
        if let Some(unit) = unit {
            unit.cancel.cancel();
            if let Err(err) = unit.handle.await {
                tracing::warn!(task_id = %task_id, error = %err, "cancelled unit panicked");
            }
            return true;
        }

        match &self.manager {
            Some(manager) => manager.cancel_task(task_id).await,
            None => false,
        }
    }

    /// IDs of background runs currently tracked by this runner.
    pub async fn get_running_tasks(&self) -> Vec<Uuid> {
        self.running.read().await.keys().copied().collect()
    }
}

/// Execute a task function against its context and persist the outcome.
///
/// Storage errors propagate to the caller; task-function errors do not —
/// they become the failed result.
async fn execute_task(
    manager: Option<Arc<TaskManager>>,
    task_id: Uuid,
    task: Arc<dyn TaskFn>,
    mut context: TaskContext,
) -> Result<TaskRunResult, Error> {
    let started = Utc::now();
    let outcome = task.run(&mut context).await;
    let duration_ms = (Utc::now() - started).num_milliseconds().max(0);
    let total_steps = context.step_count();
    let total_tool_calls = context.total_tool_calls();

    match outcome {
        Ok(output) => {
            if let Some(manager) = &manager {
                let payload = json!({
                    "output": output,
                    "execution_summary": context.execution_summary(),
                    "steps": context.steps(),
                });
                manager.complete_task(task_id, payload).await?;
            }
            tracing::debug!(task_id = %task_id, total_steps, "task completed");
            Ok(TaskRunResult {
                task_id,
                success: true,
                final_output: Some(output),
                error: None,
                context,
                total_steps,
                total_tool_calls,
                duration_ms,
            })
        }
        Err(err) => {
            let message = err.to_string();
            if let Some(manager) = &manager {
                manager.fail_task(task_id, &message).await?;
            }
            tracing::debug!(task_id = %task_id, error = %message, "task failed");
            Ok(TaskRunResult {
                task_id,
                success: false,
                final_output: None,
                error: Some(message),
                context,
                total_steps,
                total_tool_calls,
                duration_ms,
            })
        }
    }
}
