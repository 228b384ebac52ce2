//! 工具执行器
//!
//! 持有 ToolRegistry、单次调用超时与取消宽限期：
//! 超时、panic、取消都转为失败的 ToolResult（不会向上传播）；每次调用输出结构化审计日志（JSON）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::tools::{ToolCallRequest, ToolDefinition, ToolRegistry, ToolResult};

/// 工具执行器：对每次调用施加超时、隔离 panic、响应取消
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    cancel_grace: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            cancel_grace: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.list_all().await
    }

    /// 执行一次调用；取消后给在途执行 cancel_grace 的时间返回结果
    pub async fn execute(&self, call: &ToolCallRequest, cancel: &CancellationToken) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&call.arguments);

        let run = timeout(
            self.timeout,
            AssertUnwindSafe(self.registry.execute(call, cancel)).catch_unwind(),
        );
        tokio::pin!(run);

        let finished = tokio::select! {
            r = &mut run => Some(r),
            _ = cancel.cancelled() => timeout(self.cancel_grace, &mut run).await.ok(),
        };

        let (mut result, outcome) = match finished {
            Some(Ok(Ok(result))) => {
                let outcome = if result.success { "ok" } else { "error" };
                (result, outcome)
            }
            Some(Ok(Err(panic))) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(tool = %call.name, panic = %msg, "tool panicked");
                (
                    ToolResult::failure(call, AgentError::ToolPanic(msg).to_string()),
                    "panic",
                )
            }
            Some(Err(_)) => (
                ToolResult::failure(
                    call,
                    AgentError::ToolTimeout(format!(
                        "{} exceeded {}s",
                        call.name,
                        self.timeout.as_secs_f64()
                    ))
                    .to_string(),
                ),
                "timeout",
            ),
            None => (
                ToolResult::failure(call, AgentError::Cancelled.to_string()),
                "cancelled",
            ),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        result.duration_ms = duration_ms;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": result.success,
            "outcome": outcome,
            "cached": result.cached,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
