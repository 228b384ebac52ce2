//! 任务状态机
//!
//! Initializing → (Thinking → Dispatching → Observing)* → Finalizing；
//! 任意非终态都可进入 Failed / Cancelled。

use serde::Serialize;

/// 任务阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Initializing,
    Thinking,
    Dispatching,
    Observing,
    Finalizing,
    Failed,
    Cancelled,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Finalizing | TaskPhase::Failed | TaskPhase::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) | (_, Cancelled) => true,
            (Initializing, Thinking) => true,
            (Thinking, Dispatching) | (Thinking, Finalizing) | (Thinking, Thinking) => true,
            (Dispatching, Observing) => true,
            (Observing, Thinking) => true,
            _ => false,
        }
    }
}

/// 任务终态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}
