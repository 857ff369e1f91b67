//! Turn-taking agent loop, expressed as a task function.
//!
//! The engine drives the loop and records one step per turn; the actual
//! model/agent work lives behind [`TurnProvider`], which the host supplies.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::TaskError;
use crate::task::context::{StepStatus, StepType, TaskContext};
use crate::task::runner::TaskFn;

/// Message fed back into the next turn when the provider has not finished.
const CONTINUE_MESSAGE: &str = "Continue with the task";

/// Who produced a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One message in the accumulated conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: TurnRole,
    pub content: String,
}

impl TurnMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// What the provider sees for one turn.
#[derive(Debug)]
pub struct TurnRequest<'a> {
    /// 0-based turn index.
    pub turn: usize,
    /// The message driving this turn.
    pub message: &'a str,
    /// Conversation so far, current message included.
    pub history: &'a [TurnMessage],
}

/// A tool invocation the provider reports having made during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnToolCall {
    pub name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// What the provider returns for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Assistant content for the turn.
    pub content: String,
    /// Tool invocations made during the turn, already executed.
    pub tool_calls: Vec<TurnToolCall>,
    /// Whether the provider considers the task finished.
    pub is_final: bool,
}

/// External turn provider — the actual agent/model invocation.
///
/// The engine only counts turns and records steps and tool calls around it;
/// it never executes tools itself.
#[async_trait]
pub trait TurnProvider: Send + Sync {
    async fn next_turn(&self, request: TurnRequest<'_>) -> Result<TurnOutcome, TaskError>;
}

/// Task function running a turn-taking loop against a [`TurnProvider`].
pub struct AgentTask {
    provider: Arc<dyn TurnProvider>,
    input: String,
    max_turns: usize,
}

impl AgentTask {
    pub fn new(provider: Arc<dyn TurnProvider>, input: impl Into<String>, max_turns: usize) -> Self {
        Self {
            provider,
            input: input.into(),
            max_turns,
        }
    }
}

#[async_trait]
impl TaskFn for AgentTask {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value, TaskError> {
        ctx.update_state("input", json!(self.input));
        ctx.update_state("max_turns", json!(self.max_turns));

        let mut history: Vec<TurnMessage> = Vec::new();
        let mut message = self.input.clone();
        let mut turns_taken = 0usize;
        let mut completed = false;

        for turn in 0..self.max_turns {
            if ctx.is_max_steps_reached() {
                tracing::warn!(
                    task_id = %ctx.task_id,
                    turn,
                    "step bound reached before the provider finished"
                );
                break;
            }

            let step = ctx.begin_step(StepType::AgentTurn, format!("Agent turn {}", turn + 1))?;
            step.llm_input = Some(message.clone());
            history.push(TurnMessage::user(&message));

            let outcome = match self
                .provider
                .next_turn(TurnRequest {
                    turn,
                    message: &message,
                    history: &history,
                })
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    ctx.complete_step(StepStatus::Failed, None);
                    return Err(err);
                }
            };

            if let Some(step) = ctx.current_step_mut() {
                step.llm_output = Some(outcome.content.clone());
            }
            history.push(TurnMessage::assistant(&outcome.content));

            for call in &outcome.tool_calls {
                let recorded = ctx.add_tool_call(&call.name, call.arguments.clone())?;
                match (&call.result, &call.error) {
                    (_, Some(error)) => recorded.fail(error.clone()),
                    (Some(result), None) => recorded.complete(result.clone()),
                    (None, None) => recorded.complete(Value::Null),
                }
            }

            turns_taken = turn + 1;
            let intermediate = serde_json::to_value(&outcome).unwrap_or(Value::Null);
            ctx.complete_step(StepStatus::Completed, Some(intermediate));

            if outcome.is_final {
                completed = true;
                break;
            }
            message = CONTINUE_MESSAGE.to_string();
        }

        Ok(json!({
            "conversation": history,
            "turns": turns_taken,
            "completed": completed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Finishes on a fixed turn, reporting one tool call per turn.
    struct ScriptedProvider {
        final_turn: usize,
    }

    #[async_trait]
    impl TurnProvider for ScriptedProvider {
        async fn next_turn(&self, request: TurnRequest<'_>) -> Result<TurnOutcome, TaskError> {
            Ok(TurnOutcome {
                content: format!("reply {}", request.turn + 1),
                tool_calls: vec![TurnToolCall {
                    name: "lookup".to_string(),
                    arguments: json!({"turn": request.turn}),
                    result: Some(json!("found")),
                    error: None,
                }],
                is_final: request.turn >= self.final_turn,
            })
        }
    }

    /// Fails on its first turn.
    struct BrokenProvider;

    #[async_trait]
    impl TurnProvider for BrokenProvider {
        async fn next_turn(&self, _request: TurnRequest<'_>) -> Result<TurnOutcome, TaskError> {
            Err(TaskError::Function("provider offline".to_string()))
        }
    }

    fn ctx(max_steps: usize) -> TaskContext {
        TaskContext::new(Uuid::new_v4(), "s1", max_steps, Value::Null)
    }

    #[tokio::test]
    async fn loop_stops_when_provider_signals_final() {
        let task = AgentTask::new(Arc::new(ScriptedProvider { final_turn: 2 }), "do it", 10);
        let mut ctx = ctx(50);
        let output = task.run(&mut ctx).await.unwrap();

        assert_eq!(output["turns"], json!(3));
        assert_eq!(output["completed"], json!(true));
        assert_eq!(ctx.step_count(), 3);
        assert_eq!(ctx.total_tool_calls(), 3);

        let first = &ctx.steps()[0];
        assert_eq!(first.step_type, StepType::AgentTurn);
        assert_eq!(first.llm_input.as_deref(), Some("do it"));
        assert_eq!(first.llm_output.as_deref(), Some("reply 1"));
        assert_eq!(first.tool_calls[0].tool_name, "lookup");
        assert_eq!(first.tool_calls[0].result, Some(json!("found")));

        let second = &ctx.steps()[1];
        assert_eq!(second.llm_input.as_deref(), Some(CONTINUE_MESSAGE));
    }

    #[tokio::test]
    async fn loop_exhausts_turns_without_final() {
        let task = AgentTask::new(Arc::new(ScriptedProvider { final_turn: 99 }), "go", 3);
        let mut ctx = ctx(50);
        let output = task.run(&mut ctx).await.unwrap();

        assert_eq!(output["turns"], json!(3));
        assert_eq!(output["completed"], json!(false));
        assert_eq!(ctx.step_count(), 3);
    }

    #[tokio::test]
    async fn provider_failure_fails_the_open_step() {
        let task = AgentTask::new(Arc::new(BrokenProvider), "go", 3);
        let mut ctx = ctx(50);
        let err = task.run(&mut ctx).await;

        assert!(matches!(err, Err(TaskError::Function(_))));
        assert_eq!(ctx.step_count(), 1);
        assert_eq!(ctx.steps()[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn loop_respects_step_bound() {
        let task = AgentTask::new(Arc::new(ScriptedProvider { final_turn: 99 }), "go", 10);
        let mut ctx = ctx(2);
        let output = task.run(&mut ctx).await.unwrap();

        assert_eq!(output["turns"], json!(2));
        assert_eq!(ctx.step_count(), 2);
    }
}
