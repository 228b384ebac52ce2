//! 核心层：错误与恢复、任务状态机与上下文、并发调度、子任务协调

pub mod context;
pub mod coordinator;
pub mod error;
pub mod recovery;
pub mod state;
pub mod task_scheduler;

pub use context::{TaskContext, TaskResult, TaskStep, TokenCounters};
pub use coordinator::{
    run_serial, CoordinatorConfig, SubTaskCoordinator, SubTaskErrorCategory, SubTaskResult,
    SubTaskRunner, MAX_WORKER_CAP,
};
pub use error::{AgentError, RecoveryAction, TaskFailure};
pub use recovery::RecoveryEngine;
pub use state::{TaskPhase, TaskStatus};
pub use task_scheduler::{TaskKind, TaskScheduler};
