//! 任务调度：工具池 / 子任务池
//!
//! 按任务类型区分并发池；每个池用 Semaphore 限制并发，许可随 guard 释放。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 同一轮内的普通工具调用
    ToolExecution,
    /// 委派出去的子任务
    SubTask,
}

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    kind: TaskKind,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(kind: TaskKind, max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            kind,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 获取执行许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Internal(format!("{:?} pool closed", self.kind)))
    }

    /// 获取许可，期间若取消则返回 Cancelled
    pub async fn acquire_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            permit = self.acquire() => permit,
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(TaskKind::ToolExecution, 3)
    }
}
