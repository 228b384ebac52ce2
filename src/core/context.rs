//! 任务上下文与结果
//!
//! TaskContext 只属于一次执行；TaskResult 在成功、失败、取消时都会产出。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::state::{TaskPhase, TaskStatus};
use crate::llm::TokenUsage;
use crate::tools::{ToolCallRequest, ToolResult};

/// 累计 token 计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounters {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenCounters {
    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.prompt += usage.prompt_tokens;
        self.completion += usage.completion_tokens;
        self.total += usage.total_tokens;
    }

    pub fn merge(&mut self, other: &TokenCounters) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// 一次含工具调用的迭代
#[derive(Debug, Clone, Serialize)]
pub struct TaskStep {
    pub index: usize,
    pub thought: String,
    pub calls: Vec<ToolCallRequest>,
    pub results: Vec<ToolResult>,
    pub started_at: i64,
    pub duration_ms: u64,
}

/// 任务最终结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub session_id: String,
    pub goal: String,
    pub success: bool,
    pub status: TaskStatus,
    pub answer: String,
    pub steps: Vec<TaskStep>,
    pub iterations: usize,
    pub tokens: TokenCounters,
    pub confidence: f64,
    pub duration: Duration,
    pub error: Option<String>,
}

impl TaskResult {
    /// 失败 / 取消时可用的部分输出：最后一个成功工具结果，否则最后一次思考
    pub fn partial_output(&self) -> Option<String> {
        if !self.answer.is_empty() {
            return Some(self.answer.clone());
        }
        self.steps
            .iter()
            .rev()
            .find_map(|step| {
                step.results
                    .iter()
                    .rev()
                    .find(|r| r.success && !r.content.is_empty())
                    .map(|r| r.content.clone())
            })
            .or_else(|| {
                self.steps
                    .iter()
                    .rev()
                    .map(|s| s.thought.clone())
                    .find(|t| !t.is_empty())
            })
    }
}

/// 单次执行的可变状态
#[derive(Debug)]
pub struct TaskContext {
    pub id: String,
    pub session_id: String,
    pub goal: String,
    pub working_dir: PathBuf,
    pub tokens: TokenCounters,
    pub steps: Vec<TaskStep>,
    pub iterations: usize,
    pub answer: String,
    phase: TaskPhase,
    started: Instant,
}

impl TaskContext {
    pub fn new(goal: impl Into<String>, session_id: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            goal: goal.into(),
            working_dir,
            tokens: TokenCounters::default(),
            steps: Vec::new(),
            iterations: 0,
            answer: String::new(),
            phase: TaskPhase::Initializing,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn transition(&mut self, next: TaskPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(task_id = %self.id, from = ?self.phase, to = ?next, "unexpected phase transition");
        }
        tracing::trace!(task_id = %self.id, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// 成功工具结果占比；没有工具调用时为 1.0
    pub fn confidence(&self) -> f64 {
        let (ok, total) = self
            .steps
            .iter()
            .flat_map(|s| s.results.iter())
            .fold((0usize, 0usize), |(ok, total), r| {
                (ok + usize::from(r.success), total + 1)
            });
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    /// 按当前阶段生成结果；错误文本仅在失败 / 取消时填写
    pub fn to_result(&self, error: Option<String>) -> TaskResult {
        let status = match self.phase {
            TaskPhase::Finalizing => TaskStatus::Succeeded,
            TaskPhase::Failed => TaskStatus::Failed,
            TaskPhase::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Running,
        };
        let success = status == TaskStatus::Succeeded;
        TaskResult {
            task_id: self.id.clone(),
            session_id: self.session_id.clone(),
            goal: self.goal.clone(),
            success,
            status,
            answer: self.answer.clone(),
            steps: self.steps.clone(),
            iterations: self.iterations,
            tokens: self.tokens,
            confidence: if success { self.confidence() } else { 0.0 },
            duration: self.elapsed(),
            error,
        }
    }
}
