//! Sequential tool chains, expressed as a task function.
//!
//! A chain executes its callables strictly in list order, one step and one
//! tool call per entry. The first failure records its error on the call,
//! fails the step, and aborts the whole chain.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::error::TaskError;
use crate::task::context::{StepStatus, StepType, TaskContext};
use crate::task::runner::TaskFn;

/// Reserved argument key replaced with the previous entry's result.
pub const PREVIOUS_RESULT_KEY: &str = "_previous_result";

/// A chain callable: arguments in, result out.
pub type ChainFunc = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync>;

/// One entry of a tool chain.
#[derive(Clone)]
pub struct ChainStep {
    /// Tool name recorded for the entry.
    pub name: String,
    /// Arguments the callable is invoked with. An object containing the
    /// [`PREVIOUS_RESULT_KEY`] key has that value replaced with the previous
    /// entry's result.
    pub arguments: Value,
    func: ChainFunc,
}

impl ChainStep {
    /// Create a chain entry from an async callable.
    pub fn new<F, Fut>(name: impl Into<String>, arguments: Value, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            arguments,
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Task function executing an ordered chain of callables.
pub struct ToolChain {
    steps: Vec<ChainStep>,
}

impl ToolChain {
    pub fn new(steps: Vec<ChainStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl TaskFn for ToolChain {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value, TaskError> {
        let mut results: Vec<Value> = Vec::new();
        let mut previous: Option<Value> = None;

        for entry in &self.steps {
            ctx.begin_step(StepType::ToolCall, format!("Execute {}", entry.name))?;

            let mut arguments = entry.arguments.clone();
            if let (Some(prev), Some(object)) = (previous.as_ref(), arguments.as_object_mut()) {
                if object.contains_key(PREVIOUS_RESULT_KEY) {
                    object.insert(PREVIOUS_RESULT_KEY.to_string(), prev.clone());
                }
            }

            let call = ctx.add_tool_call(&entry.name, arguments.clone())?;
            match (entry.func)(arguments).await {
                Ok(value) => {
                    call.complete(value.clone());
                    ctx.complete_step(StepStatus::Completed, Some(value.clone()));
                    previous = Some(value.clone());
                    results.push(value);
                }
                Err(err) => {
                    call.fail(err.to_string());
                    ctx.complete_step(StepStatus::Failed, None);
                    tracing::debug!(tool = %entry.name, error = %err, "tool chain aborted");
                    return Err(err);
                }
            }
        }

        let final_result = results.last().cloned().unwrap_or(Value::Null);
        Ok(json!({
            "results": results,
            "final_result": final_result,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use uuid::Uuid;

    fn ctx() -> TaskContext {
        TaskContext::new(Uuid::new_v4(), "s1", 50, Value::Null)
    }

    fn add_step(name: &str, arguments: Value, amount: i64) -> ChainStep {
        ChainStep::new(name, arguments, move |args: Value| async move {
            let base = args
                .get(PREVIOUS_RESULT_KEY)
                .and_then(Value::as_i64)
                .or_else(|| args.get("a").and_then(Value::as_i64))
                .unwrap_or(0);
            Ok(json!(base + amount))
        })
    }

    #[tokio::test]
    async fn chain_threads_previous_result() {
        let chain = ToolChain::new(vec![
            add_step("double", json!({"a": 1}), 1),
            add_step("again", json!({PREVIOUS_RESULT_KEY: null}), 2),
        ]);
        let mut ctx = ctx();
        let output = chain.run(&mut ctx).await.unwrap();

        assert_eq!(output["results"], json!([2, 4]));
        assert_eq!(output["final_result"], json!(4));
        assert_eq!(ctx.step_count(), 2);
        assert_eq!(ctx.total_tool_calls(), 2);

        // The second call saw the first call's result.
        let second = &ctx.steps()[1].tool_calls[0];
        assert_eq!(second.arguments[PREVIOUS_RESULT_KEY], json!(2));
    }

    #[tokio::test]
    async fn chain_without_placeholder_ignores_previous() {
        let chain = ToolChain::new(vec![
            add_step("first", json!({"a": 5}), 0),
            add_step("second", json!({"a": 10}), 0),
        ]);
        let mut ctx = ctx();
        let output = chain.run(&mut ctx).await.unwrap();
        assert_eq!(output["results"], json!([5, 10]));
    }

    #[tokio::test]
    async fn empty_chain_yields_null_final_result() {
        let chain = ToolChain::new(Vec::new());
        let mut ctx = ctx();
        let output = chain.run(&mut ctx).await.unwrap();
        assert_eq!(output["results"], json!([]));
        assert_eq!(output["final_result"], Value::Null);
    }

    #[tokio::test]
    async fn failure_aborts_and_preserves_partial_progress() {
        let chain = ToolChain::new(vec![
            add_step("ok", json!({"a": 1}), 0),
            ChainStep::new("broken", json!({}), |_args: Value| async {
                Err(TaskError::Tool {
                    name: "broken".to_string(),
                    reason: "bad input".to_string(),
                })
            }),
            add_step("never", json!({}), 0),
        ]);
        let mut ctx = ctx();
        let err = chain.run(&mut ctx).await;

        assert!(matches!(err, Err(TaskError::Tool { .. })));
        // Only the first two entries ran; the failing call kept its error.
        assert_eq!(ctx.step_count(), 2);
        assert_eq!(ctx.steps()[0].status, StepStatus::Completed);
        assert_eq!(ctx.steps()[1].status, StepStatus::Failed);
        let failed_call = &ctx.steps()[1].tool_calls[0];
        assert_eq!(
            failed_call.error.as_deref(),
            Some("Tool broken failed: bad input")
        );
    }
}
