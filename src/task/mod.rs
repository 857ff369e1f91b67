//! Task lifecycle: records, contexts, the manager, and the runner.

pub mod agent;
pub mod chain;
pub mod context;
pub mod manager;
pub mod record;
pub mod runner;

pub use agent::{AgentTask, TurnMessage, TurnOutcome, TurnProvider, TurnRequest, TurnToolCall};
pub use chain::{ChainStep, PREVIOUS_RESULT_KEY, ToolChain};
pub use context::{
    ContextSnapshot, ExecutionSummary, StepStatus, StepType, TaskContext, TaskStep, ToolCall,
};
pub use manager::{CANCELLED_MESSAGE, TaskManager};
pub use record::{NewTask, TaskRecord, TaskStatus};
pub use runner::{
    AgentRunRequest, ChainRunRequest, RunOutcome, RunRequest, TaskFn, TaskRunResult, TaskRunner,
};
