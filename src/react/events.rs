//! 任务进度事件：状态变化、思考、工具调用、子任务进度、最终答案
//!
//! 事件经无界通道发送，发送方从不阻塞；接收端关闭时静默丢弃。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::TaskPhase;

/// 单个过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 阶段变化或提示信息
    Status { phase: TaskPhase, message: String },
    /// 迭代步数更新
    StepUpdate { step: usize, max_steps: usize },
    /// 模型的思考内容
    Reasoning { text: String },
    /// 开始调用工具
    ToolStart {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具输出片段（预览）
    ToolStreamChunk {
        call_id: String,
        tool: String,
        chunk: String,
    },
    /// 工具调用结束
    ToolComplete {
        call_id: String,
        tool: String,
        success: bool,
        duration_ms: u64,
    },
    /// 子任务进度
    SubtaskProgress {
        index: usize,
        total: usize,
        message: String,
    },
    /// 子任务结束
    SubtaskComplete {
        index: usize,
        success: bool,
        category: Option<String>,
        duration_ms: u64,
    },
    /// Token 使用统计（本次调用 + 累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        cumulative_total: u64,
    },
    FinalAnswer { text: String },
    Error { text: String },
}

/// 带来源信息的事件
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEnvelope {
    pub task_id: String,
    pub session_id: String,
    /// 子任务事件指向发起委派的父任务
    pub parent_task_id: Option<String>,
    pub seq: u64,
    pub timestamp_ms: i64,
    pub event: ProgressEvent,
}

/// 事件发送端；clone 共享同一通道与序号
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEnvelope>,
    task_id: String,
    session_id: String,
    parent_task_id: Option<String>,
    seq: Arc<AtomicU64>,
}

impl ProgressSink {
    /// 新建通道，返回发送端与接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn new(tx: mpsc::UnboundedSender<ProgressEnvelope>) -> Self {
        Self {
            tx,
            task_id: String::new(),
            session_id: String::new(),
            parent_task_id: None,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 绑定到具体任务；若当前已绑定任务，则新任务记为其子任务
    pub fn for_task(&self, task_id: &str, session_id: &str) -> Self {
        let parent = if self.task_id.is_empty() {
            self.parent_task_id.clone()
        } else {
            Some(self.task_id.clone())
        };
        Self {
            tx: self.tx.clone(),
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            parent_task_id: parent,
            seq: Arc::clone(&self.seq),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn emit(&self, event: ProgressEvent) {
        let envelope = ProgressEnvelope {
            task_id: self.task_id.clone(),
            session_id: self.session_id.clone(),
            parent_task_id: self.parent_task_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event,
        };
        let _ = self.tx.send(envelope);
    }
}

/// 可选 sink 的发送辅助
pub(crate) fn send_event(sink: Option<&ProgressSink>, event: ProgressEvent) {
    if let Some(s) = sink {
        s.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_sink_records_parent() {
        let (root, mut rx) = ProgressSink::channel();
        let parent = root.for_task("t1", "s1");
        let child = parent.for_task("t2", "s2");
        parent.emit(ProgressEvent::FinalAnswer { text: "a".into() });
        child.emit(ProgressEvent::FinalAnswer { text: "b".into() });

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.task_id, "t1");
        assert_eq!(first.parent_task_id, None);
        assert_eq!(second.task_id, "t2");
        assert_eq!(second.parent_task_id.as_deref(), Some("t1"));
        assert!(second.seq > first.seq);
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        sink.emit(ProgressEvent::Error { text: "x".into() });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = ProgressEvent::ToolComplete {
            call_id: "c1".into(),
            tool: "ls".into(),
            success: true,
            duration_ms: 3,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_complete");
    }
}
