//! Task execution context — the live, single-writer state of one task run.
//!
//! A [`TaskContext`] records what a task actually did: an append-only log of
//! completed [`TaskStep`]s, each bundling zero or more [`ToolCall`]s, plus a
//! scratch key-value store for intermediate state. The context has no
//! internal locking; it is owned by exactly one run and mutated through
//! `&mut` only.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

/// Kind of work a step represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// One or more tool invocations.
    ToolCall,
    /// A model call.
    LlmCall,
    /// A branching decision.
    Decision,
    /// Final wrap-up work.
    Completion,
    /// One turn of an agent loop.
    AgentTurn,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ToolCall => "tool_call",
            Self::LlmCall => "llm_call",
            Self::Decision => "decision",
            Self::Completion => "completion",
            Self::AgentTurn => "agent_turn",
        };
        write!(f, "{s}")
    }
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A timed record of one named sub-operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID.
    pub call_id: Uuid,
    /// Name of the invoked tool.
    pub tool_name: String,
    /// Arguments the tool was invoked with.
    pub arguments: Value,
    /// Result payload, set on completion.
    pub result: Option<Value>,
    /// Error message if the call failed.
    pub error: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds, set on completion.
    pub duration_ms: Option<i64>,
}

impl ToolCall {
    /// Create a new running call.
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            tool_name: tool_name.into(),
            arguments,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Mark the call completed with a result. Last write wins.
    pub fn complete(&mut self, result: Value) {
        self.finish(Some(result), None);
    }

    /// Mark the call failed with an error. Last write wins.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(None, Some(error.into()));
    }

    /// Check whether the call has finished.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    fn finish(&mut self, result: Option<Value>, error: Option<String>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.result = result;
        self.error = error;
    }
}

/// A bounded phase of a task's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    /// Unique step ID.
    pub step_id: Uuid,
    /// 1-based step number, monotonic within a context.
    pub step_number: usize,
    /// Kind of work this step represents.
    pub step_type: StepType,
    /// Human-readable description.
    pub description: String,
    /// Tool calls recorded during the step, in insertion order.
    pub tool_calls: Vec<ToolCall>,
    /// Model input, if the step involved a model call.
    pub llm_input: Option<String>,
    /// Model output, if the step involved a model call.
    pub llm_output: Option<String>,
    /// Decision text, if the step was a decision point.
    pub decision: Option<String>,
    /// Opaque intermediate result.
    pub intermediate_result: Option<Value>,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds, set on completion.
    pub duration_ms: Option<i64>,
    /// Current status.
    pub status: StepStatus,
}

impl TaskStep {
    fn new(step_number: usize, step_type: StepType, description: String) -> Self {
        Self {
            step_id: Uuid::new_v4(),
            step_number,
            step_type,
            description,
            tool_calls: Vec::new(),
            llm_input: None,
            llm_output: None,
            decision: None,
            intermediate_result: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            status: StepStatus::Running,
        }
    }

    /// Finalize the step with a status and optional intermediate result.
    pub fn complete(&mut self, status: StepStatus, intermediate_result: Option<Value>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.status = status;
        if intermediate_result.is_some() {
            self.intermediate_result = intermediate_result;
        }
    }

    /// Append a tool call and return a handle to it.
    pub fn add_tool_call(&mut self, call: ToolCall) -> &mut ToolCall {
        self.tool_calls.push(call);
        let idx = self.tool_calls.len() - 1;
        &mut self.tool_calls[idx]
    }
}

/// Aggregate view of a context's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub task_id: Uuid,
    pub session_id: String,
    pub total_steps: usize,
    pub total_tool_calls: usize,
    /// Per-tool-name invocation counts, deterministically ordered.
    pub tool_calls_by_tool: BTreeMap<String, usize>,
    pub total_duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted shape of a context, with its summary embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub task_id: Uuid,
    pub session_id: String,
    pub steps: Vec<TaskStep>,
    pub current_step: Option<TaskStep>,
    pub state: HashMap<String, Value>,
    pub metadata: Value,
    pub max_steps: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub summary: ExecutionSummary,
}

/// The live execution state of one task run.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task this context belongs to.
    pub task_id: Uuid,
    /// Session this context belongs to.
    pub session_id: String,
    /// Completed steps, append-only.
    steps: Vec<TaskStep>,
    /// The currently open step, if any.
    current: Option<TaskStep>,
    /// Scratch key-value state, last write wins.
    state: HashMap<String, Value>,
    /// Metadata snapshot taken at creation, immutable afterwards.
    metadata: Value,
    /// Hard bound on the number of recorded steps.
    max_steps: usize,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the context was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl TaskContext {
    /// Create a new context for one task run.
    pub fn new(
        task_id: Uuid,
        session_id: impl Into<String>,
        max_steps: usize,
        metadata: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            session_id: session_id.into(),
            steps: Vec::new(),
            current: None,
            state: HashMap::new(),
            metadata,
            max_steps,
            started_at: now,
            updated_at: now,
        }
    }

    /// Number of completed steps. The open step is excluded until completed.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Total tool calls across completed steps.
    pub fn total_tool_calls(&self) -> usize {
        self.steps.iter().map(|s| s.tool_calls.len()).sum()
    }

    /// Whether the step bound has been reached.
    pub fn is_max_steps_reached(&self) -> bool {
        self.steps.len() >= self.max_steps
    }

    /// The configured step bound.
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Completed steps, in order.
    pub fn steps(&self) -> &[TaskStep] {
        &self.steps
    }

    /// The currently open step, if any.
    pub fn current_step(&self) -> Option<&TaskStep> {
        self.current.as_ref()
    }

    /// Mutable access to the currently open step, if any.
    pub fn current_step_mut(&mut self) -> Option<&mut TaskStep> {
        self.current.as_mut()
    }

    /// Metadata snapshot taken at creation.
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Open a new step and make it current.
    ///
    /// A step left open by the caller is completed (data preserved) before
    /// the new one opens. Returns `MaxStepsExceeded` once the step bound is
    /// reached.
    pub fn begin_step(
        &mut self,
        step_type: StepType,
        description: impl Into<String>,
    ) -> Result<&mut TaskStep, TaskError> {
        if let Some(mut open) = self.current.take() {
            tracing::warn!(
                task_id = %self.task_id,
                step_number = open.step_number,
                "step left open, completing it before starting the next"
            );
            open.complete(StepStatus::Completed, None);
            self.steps.push(open);
        }
        if self.steps.len() >= self.max_steps {
            return Err(TaskError::MaxStepsExceeded {
                max: self.max_steps,
            });
        }

        let step = TaskStep::new(self.steps.len() + 1, step_type, description.into());
        self.updated_at = Utc::now();
        Ok(self.current.insert(step))
    }

    /// Finalize the current step and append it to the log.
    ///
    /// No-op when no step is open.
    pub fn complete_step(&mut self, status: StepStatus, intermediate_result: Option<Value>) {
        if let Some(mut step) = self.current.take() {
            step.complete(status, intermediate_result);
            self.steps.push(step);
            self.updated_at = Utc::now();
        }
    }

    /// Record a tool call on the current step, opening a `ToolCall` step if
    /// none is open. Returns a handle so the caller completes the call
    /// directly.
    pub fn add_tool_call(
        &mut self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<&mut ToolCall, TaskError> {
        if self.current.is_none() {
            self.begin_step(StepType::ToolCall, format!("Call {tool_name}"))?;
        }
        self.updated_at = Utc::now();
        let step = self.current.as_mut().expect("a step is open");
        Ok(step.add_tool_call(ToolCall::new(tool_name, arguments)))
    }

    /// Set a scratch state value, replacing any previous one.
    pub fn update_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    /// Get a scratch state value.
    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// All tool calls in order, including those on the open step.
    pub fn all_tool_calls(&self) -> Vec<&ToolCall> {
        self.steps
            .iter()
            .chain(self.current.as_ref())
            .flat_map(|s| s.tool_calls.iter())
            .collect()
    }

    /// Aggregate view over the completed steps.
    pub fn execution_summary(&self) -> ExecutionSummary {
        let mut tool_calls_by_tool: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_duration_ms = 0i64;

        for step in &self.steps {
            total_duration_ms += step.duration_ms.unwrap_or(0);
            for call in &step.tool_calls {
                *tool_calls_by_tool.entry(call.tool_name.clone()).or_insert(0) += 1;
            }
        }

        ExecutionSummary {
            task_id: self.task_id,
            session_id: self.session_id.clone(),
            total_steps: self.step_count(),
            total_tool_calls: self.total_tool_calls(),
            tool_calls_by_tool,
            total_duration_ms,
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }

    /// The persisted shape of this context, summary included.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            task_id: self.task_id,
            session_id: self.session_id.clone(),
            steps: self.steps.clone(),
            current_step: self.current.clone(),
            state: self.state.clone(),
            metadata: self.metadata.clone(),
            max_steps: self.max_steps,
            started_at: self.started_at,
            updated_at: self.updated_at,
            summary: self.execution_summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext::new(Uuid::new_v4(), "session-1", 50, Value::Null)
    }

    #[test]
    fn step_numbers_are_monotonic_from_one() {
        let mut ctx = ctx();
        for i in 1..=3 {
            let step = ctx.begin_step(StepType::Decision, format!("step {i}")).unwrap();
            assert_eq!(step.step_number, i);
            ctx.complete_step(StepStatus::Completed, None);
        }
        let numbers: Vec<usize> = ctx.steps().iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(ctx.step_count(), 3);
    }

    #[test]
    fn open_step_excluded_from_count() {
        let mut ctx = ctx();
        ctx.begin_step(StepType::ToolCall, "open").unwrap();
        assert_eq!(ctx.step_count(), 0);
        assert!(ctx.current_step().is_some());

        ctx.complete_step(StepStatus::Completed, None);
        assert_eq!(ctx.step_count(), 1);
        assert!(ctx.current_step().is_none());
    }

    #[test]
    fn complete_step_without_open_is_noop() {
        let mut ctx = ctx();
        ctx.complete_step(StepStatus::Completed, None);
        assert_eq!(ctx.step_count(), 0);
    }

    #[test]
    fn double_begin_preserves_first_step() {
        let mut ctx = ctx();
        ctx.begin_step(StepType::ToolCall, "first").unwrap();
        ctx.add_tool_call("alpha", json!({})).unwrap();
        ctx.begin_step(StepType::ToolCall, "second").unwrap();
        ctx.complete_step(StepStatus::Completed, None);

        // The abandoned step was completed, not dropped.
        assert_eq!(ctx.step_count(), 2);
        assert_eq!(ctx.steps()[0].description, "first");
        assert_eq!(ctx.steps()[0].status, StepStatus::Completed);
        assert_eq!(ctx.steps()[0].tool_calls.len(), 1);
        assert_eq!(ctx.steps()[0].step_number, 1);
        assert_eq!(ctx.steps()[1].step_number, 2);
    }

    #[test]
    fn max_steps_is_enforced() {
        let mut ctx = TaskContext::new(Uuid::new_v4(), "s", 2, Value::Null);
        ctx.begin_step(StepType::ToolCall, "one").unwrap();
        ctx.complete_step(StepStatus::Completed, None);
        ctx.begin_step(StepType::ToolCall, "two").unwrap();
        ctx.complete_step(StepStatus::Completed, None);
        assert!(ctx.is_max_steps_reached());

        let err = ctx.begin_step(StepType::ToolCall, "three");
        assert!(matches!(err, Err(TaskError::MaxStepsExceeded { max: 2 })));
        assert_eq!(ctx.step_count(), 2);
    }

    #[test]
    fn add_tool_call_opens_implicit_step() {
        let mut ctx = ctx();
        ctx.add_tool_call("search", json!({"q": "rust"})).unwrap();

        let step = ctx.current_step().unwrap();
        assert_eq!(step.step_type, StepType::ToolCall);
        assert_eq!(step.description, "Call search");
        assert_eq!(step.tool_calls.len(), 1);
    }

    #[test]
    fn tool_call_timing() {
        let mut ctx = ctx();
        let call = ctx.add_tool_call("echo", json!({})).unwrap();
        assert!(call.duration_ms.is_none());
        assert!(!call.is_completed());

        call.complete(json!("out"));
        assert!(call.is_completed());
        let duration = call.duration_ms.unwrap();
        assert!(duration >= 0);
        let span = call.completed_at.unwrap() - call.started_at;
        assert_eq!(duration, span.num_milliseconds());
    }

    #[test]
    fn tool_call_fail_records_error() {
        let mut call = ToolCall::new("broken", json!({}));
        call.fail("no such host");
        assert_eq!(call.error.as_deref(), Some("no such host"));
        assert!(call.result.is_none());
        assert!(call.duration_ms.is_some());
    }

    #[test]
    fn total_tool_calls_counts_completed_steps_only() {
        let mut ctx = ctx();
        ctx.add_tool_call("a", json!({})).unwrap();
        ctx.add_tool_call("a", json!({})).unwrap();
        assert_eq!(ctx.total_tool_calls(), 0);

        ctx.complete_step(StepStatus::Completed, None);
        assert_eq!(ctx.total_tool_calls(), 2);

        ctx.add_tool_call("b", json!({})).unwrap();
        assert_eq!(ctx.total_tool_calls(), 2);
        assert_eq!(ctx.all_tool_calls().len(), 3);
    }

    #[test]
    fn scratch_state_last_write_wins() {
        let mut ctx = ctx();
        ctx.update_state("k", json!(1));
        ctx.update_state("k", json!(2));
        assert_eq!(ctx.get_state("k"), Some(&json!(2)));
        assert_eq!(ctx.get_state("missing"), None);
    }

    #[test]
    fn summary_counts_and_durations() {
        let mut ctx = ctx();
        ctx.add_tool_call("alpha", json!({})).unwrap().complete(json!(1));
        ctx.add_tool_call("beta", json!({})).unwrap().complete(json!(2));
        ctx.complete_step(StepStatus::Completed, None);
        ctx.add_tool_call("alpha", json!({})).unwrap().complete(json!(3));
        ctx.complete_step(StepStatus::Completed, None);

        let summary = ctx.execution_summary();
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.total_tool_calls, 3);
        assert_eq!(summary.tool_calls_by_tool.get("alpha"), Some(&2));
        assert_eq!(summary.tool_calls_by_tool.get("beta"), Some(&1));
        assert!(summary.total_duration_ms >= 0);
    }

    #[test]
    fn snapshot_summary_is_idempotent() {
        let mut ctx = ctx();
        ctx.add_tool_call("alpha", json!({"n": 1})).unwrap().complete(json!(2));
        ctx.complete_step(StepStatus::Completed, Some(json!(2)));

        let summary = ctx.execution_summary();
        let encoded = serde_json::to_string(&ctx.snapshot()).unwrap();
        let decoded: ContextSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.summary, summary);
    }

    #[test]
    fn snapshot_includes_open_step() {
        let mut ctx = ctx();
        ctx.begin_step(StepType::AgentTurn, "open turn").unwrap();
        let snapshot = ctx.snapshot();
        assert_eq!(
            snapshot.current_step.as_ref().map(|s| s.description.as_str()),
            Some("open turn")
        );
        assert!(snapshot.steps.is_empty());
    }
}
