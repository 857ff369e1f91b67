//! Task tracer — creates, retains, and reconstructs traces.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::TraceError;
use crate::task::context::TaskContext;
use crate::trace::span::{
    SpanStatus, SpanType, Trace, TraceExport, TraceStatistics, TraceTreeExport,
};

/// Creates and retains traces until they are explicitly evicted.
pub struct TaskTracer {
    traces: RwLock<HashMap<Uuid, Trace>>,
    keep_count: usize,
}

impl TaskTracer {
    /// Create a tracer with default retention.
    pub fn new() -> Self {
        Self {
            traces: RwLock::new(HashMap::new()),
            keep_count: crate::config::DEFAULT_TRACE_KEEP,
        }
    }

    /// Create a tracer with retention from the engine configuration.
    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            traces: RwLock::new(HashMap::new()),
            keep_count: config.trace_keep_count,
        }
    }

    /// Register a new running trace and return its ID.
    pub async fn start_trace(
        &self,
        task_id: Uuid,
        session_id: &str,
        name: &str,
        metadata: Value,
    ) -> Uuid {
        let trace = Trace::new(task_id, session_id, name, metadata);
        let trace_id = trace.trace_id;
        self.traces.write().await.insert(trace_id, trace);
        tracing::debug!(trace_id = %trace_id, task_id = %task_id, "started trace");
        trace_id
    }

    /// Run a closure against a retained trace.
    pub async fn with_trace<F, R>(&self, trace_id: Uuid, f: F) -> Result<R, TraceError>
    where
        F: FnOnce(&mut Trace) -> R,
    {
        let mut traces = self.traces.write().await;
        let trace = traces
            .get_mut(&trace_id)
            .ok_or(TraceError::TraceNotFound { id: trace_id })?;
        Ok(f(trace))
    }

    /// Create a span on a retained trace.
    pub async fn create_span(
        &self,
        trace_id: Uuid,
        name: &str,
        span_type: SpanType,
        parent_span_id: Option<Uuid>,
        attributes: Value,
    ) -> Result<Uuid, TraceError> {
        self.with_trace(trace_id, |trace| {
            trace.create_span(name, span_type, parent_span_id, attributes)
        })
        .await?
    }

    /// End a span on a retained trace.
    pub async fn end_span(
        &self,
        trace_id: Uuid,
        span_id: Uuid,
        status: SpanStatus,
        error: Option<String>,
    ) -> Result<(), TraceError> {
        self.with_trace(trace_id, |trace| trace.end_span(span_id, status, error))
            .await?
    }

    /// End a retained trace.
    pub async fn end_trace(&self, trace_id: Uuid, status: SpanStatus) -> Result<(), TraceError> {
        self.with_trace(trace_id, |trace| trace.end(status)).await
    }

    /// Rebuild a trace from a finished context, retain it, and return its ID.
    ///
    /// The rebuilt trace carries one span per recorded step and one child
    /// span per tool call, and is already ended.
    pub async fn trace_from_context(&self, context: &TaskContext) -> Uuid {
        let mut trace = Trace::from_context(context);
        trace.end(SpanStatus::Completed);
        let trace_id = trace.trace_id;
        self.traces.write().await.insert(trace_id, trace);
        tracing::debug!(trace_id = %trace_id, task_id = %context.task_id, "reconstructed trace");
        trace_id
    }

    /// Get a copy of a retained trace.
    pub async fn get_trace(&self, trace_id: Uuid) -> Option<Trace> {
        self.traces.read().await.get(&trace_id).cloned()
    }

    /// Get a copy of the trace covering a task, if one is retained.
    pub async fn get_trace_by_task(&self, task_id: Uuid) -> Option<Trace> {
        self.traces
            .read()
            .await
            .values()
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    /// Export a retained trace in full.
    pub async fn export_trace(&self, trace_id: Uuid) -> Option<TraceExport> {
        self.traces.read().await.get(&trace_id).map(Trace::export)
    }

    /// Export a retained trace as a span forest.
    pub async fn export_trace_tree(&self, trace_id: Uuid) -> Option<TraceTreeExport> {
        self.traces
            .read()
            .await
            .get(&trace_id)
            .map(Trace::export_tree)
    }

    /// Statistics for a retained trace.
    pub async fn get_statistics(&self, trace_id: Uuid) -> Option<TraceStatistics> {
        self.traces
            .read()
            .await
            .get(&trace_id)
            .map(Trace::statistics)
    }

    /// Number of retained traces.
    pub async fn trace_count(&self) -> usize {
        self.traces.read().await.len()
    }

    /// Evict completed traces beyond the `keep_count` most recently ended.
    ///
    /// Running traces are never evicted. Returns the number of traces
    /// removed.
    pub async fn clear_completed_traces(&self, keep_count: usize) -> usize {
        let mut traces = self.traces.write().await;
        let mut completed: Vec<(Uuid, DateTime<Utc>)> = traces
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.trace_id, t.ended_at.unwrap_or_else(Utc::now)))
            .collect();

        // Newest end first; everything past keep_count goes.
        completed.sort_by(|a, b| b.1.cmp(&a.1));
        let evicted: Vec<Uuid> = completed
            .into_iter()
            .skip(keep_count)
            .map(|(id, _)| id)
            .collect();
        for trace_id in &evicted {
            traces.remove(trace_id);
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted completed traces");
        }
        evicted.len()
    }

    /// Evict using the configured retention.
    pub async fn prune(&self) -> usize {
        self.clear_completed_traces(self.keep_count).await
    }
}

impl Default for TaskTracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::context::StepStatus;
    use serde_json::json;

    #[tokio::test]
    async fn start_and_end_trace() {
        let tracer = TaskTracer::new();
        let task_id = Uuid::new_v4();
        let trace_id = tracer
            .start_trace(task_id, "s1", "Task: demo", Value::Null)
            .await;

        let span_id = tracer
            .create_span(trace_id, "work", SpanType::Generic, None, Value::Null)
            .await
            .unwrap();
        tracer
            .end_span(trace_id, span_id, SpanStatus::Completed, None)
            .await
            .unwrap();
        tracer
            .end_trace(trace_id, SpanStatus::Completed)
            .await
            .unwrap();

        let trace = tracer.get_trace(trace_id).await.unwrap();
        assert_eq!(trace.status, SpanStatus::Completed);
        assert_eq!(trace.spans().len(), 1);
        assert!(tracer.get_trace_by_task(task_id).await.is_some());
    }

    #[tokio::test]
    async fn unknown_trace_is_an_error() {
        let tracer = TaskTracer::new();
        let err = tracer.end_trace(Uuid::new_v4(), SpanStatus::Completed).await;
        assert!(matches!(err, Err(TraceError::TraceNotFound { .. })));
        assert!(tracer.export_trace(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn reconstruction_yields_n_plus_m_spans() {
        let mut ctx = TaskContext::new(Uuid::new_v4(), "s1", 50, Value::Null);
        for step in 0..3 {
            for call in 0..2 {
                ctx.add_tool_call(&format!("tool_{step}_{call}"), json!({}))
                    .unwrap()
                    .complete(json!(call));
            }
            ctx.complete_step(StepStatus::Completed, None);
        }

        let tracer = TaskTracer::new();
        let trace_id = tracer.trace_from_context(&ctx).await;
        let stats = tracer.get_statistics(trace_id).await.unwrap();
        // 3 steps + 6 tool calls.
        assert_eq!(stats.total_spans, 9);

        let tree = tracer.export_trace_tree(trace_id).await.unwrap();
        assert_eq!(tree.spans.len(), 3);
        assert!(tree.spans.iter().all(|root| root.children.len() == 2));

        let export = tracer.export_trace(trace_id).await.unwrap();
        assert_eq!(export.spans.len(), 9);
        assert_eq!(export.statistics.total_spans, 9);
    }

    #[tokio::test]
    async fn eviction_keeps_recent_completed_and_all_running() {
        let tracer = TaskTracer::new();

        let running = tracer
            .start_trace(Uuid::new_v4(), "s1", "running", Value::Null)
            .await;

        let mut finished = Vec::new();
        for i in 0..5 {
            let trace_id = tracer
                .start_trace(Uuid::new_v4(), "s1", &format!("done {i}"), Value::Null)
                .await;
            tracer
                .end_trace(trace_id, SpanStatus::Completed)
                .await
                .unwrap();
            finished.push(trace_id);
            // Distinct end times so retention order is well defined.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let evicted = tracer.clear_completed_traces(2).await;
        assert_eq!(evicted, 3);
        assert_eq!(tracer.trace_count().await, 3);

        // The running trace survives, as do the two most recently ended.
        assert!(tracer.get_trace(running).await.is_some());
        assert!(tracer.get_trace(finished[4]).await.is_some());
        assert!(tracer.get_trace(finished[3]).await.is_some());
        assert!(tracer.get_trace(finished[0]).await.is_none());
    }

    #[tokio::test]
    async fn prune_uses_configured_retention() {
        let config = EngineConfig {
            trace_keep_count: 1,
            ..Default::default()
        };
        let tracer = TaskTracer::with_config(&config);
        for _ in 0..3 {
            let trace_id = tracer
                .start_trace(Uuid::new_v4(), "s1", "t", Value::Null)
                .await;
            tracer
                .end_trace(trace_id, SpanStatus::Failed)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(tracer.prune().await, 2);
        assert_eq!(tracer.trace_count().await, 1);
    }
}
