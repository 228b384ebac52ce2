//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / SummarizeAndPrune / Abort。

use thiserror::Error;

use crate::core::context::TaskResult;
use crate::llm::LlmError;

/// 任务执行过程中可能出现的错误（传输、工具、子任务、迭代上限、取消等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("LLM transport error: {0}")]
    Transport(#[from] LlmError),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool panicked: {0}")]
    ToolPanic(String),

    #[error("All fallbacks failed for {tool} (tried: {}): {cause}", attempted.join(", "))]
    DegradationExhausted {
        tool: String,
        attempted: Vec<String>,
        cause: String,
    },

    #[error("Sub-task panicked: {0}")]
    SubTaskPanic(String),

    #[error("Sub-task timed out: {0}")]
    SubTaskTimeout(String),

    #[error("Sub-task exceeded context limit: {0}")]
    SubTaskContextLimit(String),

    #[error("Iteration ceiling exceeded after {0} iterations")]
    IterationCeilingExceeded(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    /// 协调器参数非法等结构性错误（如 worker_cap 越界）
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// 传输层报告上下文超长（或请求过大）
    pub fn is_context_limit(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(LlmError::ContextWindowExceeded(_))
                | AgentError::Transport(LlmError::RequestTooLarge(_))
                | AgentError::SubTaskContextLimit(_)
        )
    }
}

/// 任务失败：错误本身 + 完整的任务结果（计数、步骤、历史在失败时同样保留）
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct TaskFailure {
    pub error: AgentError,
    pub result: TaskResult,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让 LLM 重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 缩小上下文窗口后重试（如超长上下文）
    SummarizeAndPrune,
    /// 终止当前任务
    Abort,
}
