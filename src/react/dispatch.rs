//! 工具调用分派
//!
//! 一轮中的调用分为三类：普通调用（并发执行，受并发上限约束）、委派调用（交给子任务协调器）、
//! 无效调用（直接生成失败结果）。结果始终按请求顺序返回。

use std::time::Instant;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::coordinator::SubTaskResult;
use crate::core::{AgentError, TaskScheduler};
use crate::react::events::{send_event, ProgressEvent, ProgressSink};
use crate::react::planner::truncate;
use crate::tools::{SourceKind, ToolCallRequest, ToolDefinition, ToolExecutor, ToolResult};

/// 委派工具名
pub const DELEGATION_TOOL: &str = "subagent";

/// 委派工具定义（子任务引擎中不提供，防止递归委派）
pub fn delegation_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: DELEGATION_TOOL.to_string(),
        description: "Delegate independent sub-goals to sub-agents that run concurrently. \
            Use \"prompt\" for one goal or \"tasks\" for several; each result comes back in order."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "a single sub-goal"},
                "tasks": {"type": "array", "items": {"type": "string"}, "description": "several independent sub-goals"}
            }
        }),
        tags: vec!["delegation".to_string()],
        source: SourceKind::Static,
    }
}

/// 解析委派参数：`prompt`（单个）或 `tasks`（多个），两者可同时给出
pub fn parse_delegation_goals(args: &Value) -> Result<Vec<String>, String> {
    let mut goals = Vec::new();
    if let Some(prompt) = args.get("prompt").and_then(|v| v.as_str()) {
        if !prompt.trim().is_empty() {
            goals.push(prompt.trim().to_string());
        }
    }
    match args.get("tasks") {
        Some(Value::Array(items)) => {
            for item in items {
                let goal = item
                    .as_str()
                    .or_else(|| item.get("prompt").and_then(|p| p.as_str()))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| format!("invalid task entry: {item}"))?;
                goals.push(goal.to_string());
            }
        }
        Some(other) => return Err(format!("tasks must be an array, got {other}")),
        None => {}
    }
    if goals.is_empty() {
        return Err("subagent requires \"prompt\" or a non-empty \"tasks\" list".to_string());
    }
    Ok(goals)
}

/// 分派计划：保存原始下标，便于按请求顺序合并结果
#[derive(Debug, Default)]
pub struct DispatchPlan {
    pub ordinary: Vec<(usize, ToolCallRequest)>,
    pub delegations: Vec<(usize, ToolCallRequest, Vec<String>)>,
    pub rejected: Vec<(usize, ToolResult)>,
}

impl DispatchPlan {
    pub fn partition(calls: &[ToolCallRequest], delegation_enabled: bool) -> Self {
        let mut plan = DispatchPlan::default();
        for (index, call) in calls.iter().enumerate() {
            if call.name != DELEGATION_TOOL {
                plan.ordinary.push((index, call.clone()));
                continue;
            }
            if !delegation_enabled {
                let err = AgentError::ToolNotFound(DELEGATION_TOOL.to_string());
                plan.rejected
                    .push((index, ToolResult::failure(call, err.to_string())));
                continue;
            }
            match parse_delegation_goals(&call.arguments) {
                Ok(goals) => plan.delegations.push((index, call.clone(), goals)),
                Err(e) => plan.rejected.push((index, ToolResult::failure(call, e))),
            }
        }
        plan
    }

    pub fn delegated_goals(&self) -> Vec<String> {
        self.delegations
            .iter()
            .flat_map(|(_, _, goals)| goals.iter().cloned())
            .collect()
    }
}

/// 并发执行普通调用（受调度器上限约束），结果顺序与输入一致
pub async fn dispatch_ordinary(
    executor: &ToolExecutor,
    scheduler: &TaskScheduler,
    calls: &[ToolCallRequest],
    cancel: &CancellationToken,
    sink: Option<&ProgressSink>,
) -> Vec<ToolResult> {
    let runs = calls.iter().map(|call| async move {
        let _permit = match scheduler.acquire_or_cancel(cancel).await {
            Ok(p) => p,
            Err(e) => return ToolResult::failure(call, e.to_string()),
        };
        send_event(
            sink,
            ProgressEvent::ToolStart {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                args: call.arguments.clone(),
            },
        );
        let result = executor.execute(call, cancel).await;
        let preview = result.observation();
        if !preview.is_empty() {
            send_event(
                sink,
                ProgressEvent::ToolStreamChunk {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    chunk: truncate(&preview, 500),
                },
            );
        }
        send_event(
            sink,
            ProgressEvent::ToolComplete {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                success: result.success,
                duration_ms: result.duration_ms,
            },
        );
        result
    });
    join_all(runs).await
}

/// 将一次委派请求对应的子任务结果格式化为一条工具结果
pub fn delegation_result(
    call: &ToolCallRequest,
    goals: &[String],
    results: &[SubTaskResult],
    started: Instant,
) -> ToolResult {
    let mut text = String::new();
    for (i, (goal, r)) in goals.iter().zip(results).enumerate() {
        let status = if r.success {
            "completed".to_string()
        } else {
            format!(
                "failed [{}]",
                r.category.map(|c| c.as_str()).unwrap_or("general")
            )
        };
        text.push_str(&format!("### Task {} ({status}): {goal}\n", i + 1));
        if !r.result.is_empty() {
            text.push_str(&r.result);
            text.push('\n');
        }
        if let Some(err) = &r.error {
            text.push_str(&format!("Error: {err}\n"));
        }
        text.push('\n');
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    let data = json!(results
        .iter()
        .map(|r| json!({
            "goal": r.goal,
            "success": r.success,
            "completed": r.completed,
            "session_id": r.session_id,
            "category": r.category.map(|c| c.as_str()),
            "duration_ms": r.duration.as_millis() as u64,
            "tokens": r.tokens.total,
        }))
        .collect::<Vec<_>>());

    let mut result = if succeeded > 0 {
        ToolResult::success(call, text.trim_end().to_string().into())
    } else {
        let mut failed = ToolResult::failure(call, "all delegated sub-tasks failed");
        failed.content = text.trim_end().to_string();
        failed
    };
    result.data = Some(data);
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
        .with_metadata("subtasks", json!(results.len()))
        .with_metadata("subtasks_succeeded", json!(succeeded))
}
