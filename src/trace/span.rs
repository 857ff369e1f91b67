//! Traces and spans — the observability view of a task's execution.
//!
//! Spans live in a flat arena indexed by ID; parent references are validated
//! when a span is inserted, so the stored forest never contains dangling
//! edges.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::TraceError;
use crate::task::context::{StepStatus, StepType, TaskContext};

/// Kind of operation a span covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    Task,
    Step,
    ToolCall,
    LlmCall,
    Decision,
    Completion,
    AgentTurn,
    Generic,
}

impl From<StepType> for SpanType {
    fn from(step_type: StepType) -> Self {
        match step_type {
            StepType::ToolCall => Self::ToolCall,
            StepType::LlmCall => Self::LlmCall,
            StepType::Decision => Self::Decision,
            StepType::Completion => Self::Completion,
            StepType::AgentTurn => Self::AgentTurn,
        }
    }
}

impl std::fmt::Display for SpanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Step => "step",
            Self::ToolCall => "tool_call",
            Self::LlmCall => "llm_call",
            Self::Decision => "decision",
            Self::Completion => "completion",
            Self::AgentTurn => "agent_turn",
            Self::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

/// Status of a span or trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Completed,
    Failed,
}

impl SpanStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl From<StepStatus> for SpanStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Running => Self::Running,
            StepStatus::Completed => Self::Completed,
            StepStatus::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One timed operation inside a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    /// Unique span ID.
    pub span_id: Uuid,
    /// Trace the span belongs to.
    pub trace_id: Uuid,
    /// Parent span, if any. Parentless spans are forest roots.
    pub parent_span_id: Option<Uuid>,
    /// Span name.
    pub name: String,
    /// Kind of operation covered.
    pub span_type: SpanType,
    /// When the span started.
    pub started_at: DateTime<Utc>,
    /// When the span ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds, set when the span ends.
    pub duration_ms: Option<i64>,
    /// Opaque attributes payload.
    pub attributes: Value,
    /// Current status.
    pub status: SpanStatus,
    /// Error message if the span failed.
    pub error: Option<String>,
}

impl TraceSpan {
    fn new(
        trace_id: Uuid,
        parent_span_id: Option<Uuid>,
        name: String,
        span_type: SpanType,
        attributes: Value,
    ) -> Self {
        Self {
            span_id: Uuid::new_v4(),
            trace_id,
            parent_span_id,
            name,
            span_type,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            attributes,
            status: SpanStatus::Running,
            error: None,
        }
    }

    /// End the span with a status and optional error.
    pub fn end(&mut self, status: SpanStatus, error: Option<String>) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.status = status;
        self.error = error;
    }
}

/// A span and its children, for tree exports.
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    pub span: TraceSpan,
    pub children: Vec<SpanNode>,
}

/// Aggregate statistics over a trace's spans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceStatistics {
    pub total_spans: usize,
    /// Span counts keyed by span type name.
    pub spans_by_type: std::collections::BTreeMap<String, usize>,
    /// Summed span durations — overlapping spans are not deduplicated.
    pub total_duration_ms: i64,
    pub failed_spans: usize,
    /// `(total - failed) / total`, 0.0 for an empty trace.
    pub success_rate: f64,
}

/// Full serialized form of a trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceExport {
    pub trace_id: Uuid,
    pub task_id: Uuid,
    pub session_id: String,
    pub name: String,
    pub spans: Vec<TraceSpan>,
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub statistics: TraceStatistics,
}

/// Serialized span forest of a trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceTreeExport {
    pub trace_id: Uuid,
    pub task_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub metadata: Value,
    pub spans: Vec<SpanNode>,
}

/// A complete execution trace: a forest of timed spans.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Unique trace ID.
    pub trace_id: Uuid,
    /// Task the trace covers.
    pub task_id: Uuid,
    /// Session the task belonged to.
    pub session_id: String,
    /// Trace name.
    pub name: String,
    /// Span arena, insertion-ordered.
    spans: Vec<TraceSpan>,
    /// Span ID → arena index.
    index: HashMap<Uuid, usize>,
    /// Opaque metadata payload.
    pub metadata: Value,
    /// When the trace started.
    pub started_at: DateTime<Utc>,
    /// When the trace ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: SpanStatus,
}

impl Trace {
    /// Create a new running trace.
    pub fn new(
        task_id: Uuid,
        session_id: impl Into<String>,
        name: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            task_id,
            session_id: session_id.into(),
            name: name.into(),
            spans: Vec::new(),
            index: HashMap::new(),
            metadata,
            started_at: Utc::now(),
            ended_at: None,
            status: SpanStatus::Running,
        }
    }

    /// Rebuild a trace from a finished context: one step span per recorded
    /// step, one tool-call child span per call inside it.
    pub fn from_context(context: &TaskContext) -> Self {
        let description = context
            .metadata()
            .get("description")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| context.task_id.to_string());

        let mut trace = Self::new(
            context.task_id,
            context.session_id.clone(),
            format!("Task: {description}"),
            context.metadata().clone(),
        );
        trace.started_at = context.started_at;

        for step in context.steps() {
            let name = if step.description.is_empty() {
                format!("Step {}", step.step_number)
            } else {
                step.description.clone()
            };
            let mut span = TraceSpan::new(
                trace.trace_id,
                None,
                name,
                SpanType::from(step.step_type),
                json!({
                    "step_number": step.step_number,
                    "step_id": step.step_id,
                }),
            );
            span.started_at = step.started_at;
            span.ended_at = step.completed_at;
            span.duration_ms = step.duration_ms;
            span.status = SpanStatus::from(step.status);
            let step_span_id = trace.push_span(span);

            for call in &step.tool_calls {
                let mut tool_span = TraceSpan::new(
                    trace.trace_id,
                    Some(step_span_id),
                    format!("Tool: {}", call.tool_name),
                    SpanType::ToolCall,
                    json!({
                        "tool_name": call.tool_name,
                        "arguments": call.arguments,
                        "result": call.result,
                        "call_id": call.call_id,
                    }),
                );
                tool_span.started_at = call.started_at;
                tool_span.ended_at = call.completed_at;
                tool_span.duration_ms = call.duration_ms;
                tool_span.status = if call.error.is_some() {
                    SpanStatus::Failed
                } else {
                    SpanStatus::Completed
                };
                tool_span.error = call.error.clone();
                trace.push_span(tool_span);
            }
        }

        trace
    }

    /// Create a new running span.
    ///
    /// A supplied parent must already exist in the trace.
    pub fn create_span(
        &mut self,
        name: impl Into<String>,
        span_type: SpanType,
        parent_span_id: Option<Uuid>,
        attributes: Value,
    ) -> Result<Uuid, TraceError> {
        if let Some(parent) = parent_span_id {
            if !self.index.contains_key(&parent) {
                return Err(TraceError::ParentSpanNotFound { id: parent });
            }
        }
        let span = TraceSpan::new(
            self.trace_id,
            parent_span_id,
            name.into(),
            span_type,
            attributes,
        );
        Ok(self.push_span(span))
    }

    /// End a span.
    pub fn end_span(
        &mut self,
        span_id: Uuid,
        status: SpanStatus,
        error: Option<String>,
    ) -> Result<(), TraceError> {
        let idx = *self
            .index
            .get(&span_id)
            .ok_or(TraceError::SpanNotFound { id: span_id })?;
        self.spans[idx].end(status, error);
        Ok(())
    }

    /// End the trace. Ending twice just overwrites the end state.
    pub fn end(&mut self, status: SpanStatus) {
        self.ended_at = Some(Utc::now());
        self.status = status;
    }

    /// Get a span by ID.
    pub fn span(&self, span_id: Uuid) -> Option<&TraceSpan> {
        self.index.get(&span_id).map(|&idx| &self.spans[idx])
    }

    /// All spans, in insertion order.
    pub fn spans(&self) -> &[TraceSpan] {
        &self.spans
    }

    /// Group spans into their forest: parentless spans are roots.
    pub fn span_tree(&self) -> Vec<SpanNode> {
        let mut children_of: HashMap<Uuid, Vec<usize>> = HashMap::new();
        let mut roots: Vec<usize> = Vec::new();
        for (idx, span) in self.spans.iter().enumerate() {
            match span.parent_span_id {
                Some(parent) => children_of.entry(parent).or_default().push(idx),
                None => roots.push(idx),
            }
        }

        fn build(
            idx: usize,
            spans: &[TraceSpan],
            children_of: &HashMap<Uuid, Vec<usize>>,
        ) -> SpanNode {
            let span = spans[idx].clone();
            let children = children_of
                .get(&span.span_id)
                .map(|kids| {
                    kids.iter()
                        .map(|&child| build(child, spans, children_of))
                        .collect()
                })
                .unwrap_or_default();
            SpanNode { span, children }
        }

        roots
            .into_iter()
            .map(|idx| build(idx, &self.spans, &children_of))
            .collect()
    }

    /// Aggregate statistics over all spans.
    pub fn statistics(&self) -> TraceStatistics {
        let total_spans = self.spans.len();
        let mut spans_by_type = std::collections::BTreeMap::new();
        let mut total_duration_ms = 0i64;
        let mut failed_spans = 0usize;

        for span in &self.spans {
            *spans_by_type.entry(span.span_type.to_string()).or_insert(0) += 1;
            total_duration_ms += span.duration_ms.unwrap_or(0);
            if span.status == SpanStatus::Failed {
                failed_spans += 1;
            }
        }

        let success_rate = if total_spans > 0 {
            (total_spans - failed_spans) as f64 / total_spans as f64
        } else {
            0.0
        };

        TraceStatistics {
            total_spans,
            spans_by_type,
            total_duration_ms,
            failed_spans,
            success_rate,
        }
    }

    /// Full serialized form, statistics included.
    pub fn export(&self) -> TraceExport {
        TraceExport {
            trace_id: self.trace_id,
            task_id: self.task_id,
            session_id: self.session_id.clone(),
            name: self.name.clone(),
            spans: self.spans.clone(),
            metadata: self.metadata.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            status: self.status,
            statistics: self.statistics(),
        }
    }

    /// Serialized span forest.
    pub fn export_tree(&self) -> TraceTreeExport {
        TraceTreeExport {
            trace_id: self.trace_id,
            task_id: self.task_id,
            name: self.name.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            status: self.status,
            metadata: self.metadata.clone(),
            spans: self.span_tree(),
        }
    }

    fn push_span(&mut self, span: TraceSpan) -> Uuid {
        let span_id = span.span_id;
        self.index.insert(span_id, self.spans.len());
        self.spans.push(span);
        span_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::context::StepStatus;

    fn trace() -> Trace {
        Trace::new(Uuid::new_v4(), "s1", "test trace", Value::Null)
    }

    #[test]
    fn create_span_validates_parent() {
        let mut trace = trace();
        let root = trace
            .create_span("root", SpanType::Task, None, Value::Null)
            .unwrap();
        let child = trace
            .create_span("child", SpanType::ToolCall, Some(root), Value::Null)
            .unwrap();
        assert_eq!(trace.span(child).unwrap().parent_span_id, Some(root));

        let err = trace.create_span("orphan", SpanType::Generic, Some(Uuid::new_v4()), Value::Null);
        assert!(matches!(err, Err(TraceError::ParentSpanNotFound { .. })));
        assert_eq!(trace.spans().len(), 2);
    }

    #[test]
    fn end_span_sets_timing() {
        let mut trace = trace();
        let span_id = trace
            .create_span("work", SpanType::Generic, None, Value::Null)
            .unwrap();
        trace
            .end_span(span_id, SpanStatus::Completed, None)
            .unwrap();

        let span = trace.span(span_id).unwrap();
        assert_eq!(span.status, SpanStatus::Completed);
        assert!(span.ended_at.is_some());
        assert!(span.duration_ms.unwrap() >= 0);

        let missing = trace.end_span(Uuid::new_v4(), SpanStatus::Completed, None);
        assert!(matches!(missing, Err(TraceError::SpanNotFound { .. })));
    }

    #[test]
    fn span_tree_is_a_forest() {
        let mut trace = trace();
        let a = trace
            .create_span("a", SpanType::Step, None, Value::Null)
            .unwrap();
        trace
            .create_span("a1", SpanType::ToolCall, Some(a), Value::Null)
            .unwrap();
        trace
            .create_span("a2", SpanType::ToolCall, Some(a), Value::Null)
            .unwrap();
        trace
            .create_span("b", SpanType::Step, None, Value::Null)
            .unwrap();

        let forest = trace.span_tree();
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].span.name, "a");
        assert_eq!(forest[0].children.len(), 2);
        assert!(forest[1].children.is_empty());
    }

    #[test]
    fn statistics_counts_types_and_failures() {
        let mut trace = trace();
        let a = trace
            .create_span("a", SpanType::Step, None, Value::Null)
            .unwrap();
        let bad = trace
            .create_span("bad", SpanType::ToolCall, Some(a), Value::Null)
            .unwrap();
        trace.end_span(a, SpanStatus::Completed, None).unwrap();
        trace
            .end_span(bad, SpanStatus::Failed, Some("broke".to_string()))
            .unwrap();

        let stats = trace.statistics();
        assert_eq!(stats.total_spans, 2);
        assert_eq!(stats.spans_by_type.get("step"), Some(&1));
        assert_eq!(stats.spans_by_type.get("tool_call"), Some(&1));
        assert_eq!(stats.failed_spans, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_trace_has_zero_success_rate() {
        let stats = trace().statistics();
        assert_eq!(stats.total_spans, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn double_end_overwrites() {
        let mut trace = trace();
        trace.end(SpanStatus::Completed);
        let first_end = trace.ended_at;
        trace.end(SpanStatus::Failed);
        assert_eq!(trace.status, SpanStatus::Failed);
        assert!(trace.ended_at >= first_end);
    }

    #[test]
    fn from_context_builds_one_span_per_step_and_call() {
        let mut ctx = TaskContext::new(
            Uuid::new_v4(),
            "s1",
            50,
            json!({"description": "reconstruction"}),
        );
        ctx.add_tool_call("alpha", json!({"x": 1}))
            .unwrap()
            .complete(json!("ok"));
        ctx.add_tool_call("beta", json!({}))
            .unwrap()
            .fail("beta broke");
        ctx.complete_step(StepStatus::Completed, None);
        ctx.begin_step(
            crate::task::context::StepType::Decision,
            "pick a branch",
        )
        .unwrap();
        ctx.complete_step(StepStatus::Completed, None);

        let trace = Trace::from_context(&ctx);
        assert_eq!(trace.name, "Task: reconstruction");
        assert_eq!(trace.task_id, ctx.task_id);
        // 2 steps + 2 tool calls.
        assert_eq!(trace.spans().len(), 4);
        assert_eq!(trace.statistics().total_spans, 4);

        let forest = trace.span_tree();
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].children.len(), 2);

        let step_span = &forest[0].span;
        assert_eq!(step_span.span_type, SpanType::ToolCall);
        assert_eq!(step_span.attributes["step_number"], json!(1));
        assert_eq!(step_span.status, SpanStatus::Completed);

        let failed = &forest[0].children[1].span;
        assert_eq!(failed.name, "Tool: beta");
        assert_eq!(failed.status, SpanStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("beta broke"));
        assert_eq!(failed.attributes["tool_name"], json!("beta"));

        let decision = &forest[1].span;
        assert_eq!(decision.span_type, SpanType::Decision);
        assert_eq!(decision.name, "pick a branch");
    }
}
