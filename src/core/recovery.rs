//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供任务引擎决定是重试、缩小窗口还是终止。

use crate::core::{AgentError, RecoveryAction};
use crate::llm::LlmError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "上一轮输出的工具调用 JSON 无法解析: {raw}。\
                调用工具时请只输出一个合法的 JSON 对象，不要夹杂其它文字。\
                格式: {{\"tool_calls\": [{{\"id\": \"call_1\", \"name\": \"工具名\", \"arguments\": {{...}}}}]}}。\
                若任务已完成，直接用自然语言给出最终答案。"
            )),
            AgentError::Transport(LlmError::ContextWindowExceeded(_)) => {
                RecoveryAction::SummarizeAndPrune
            }
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("invalid json".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_context_exceeded() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Transport(LlmError::ContextWindowExceeded("8192".into()));
        assert!(matches!(
            engine.handle(&err),
            RecoveryAction::SummarizeAndPrune
        ));
    }

    #[test]
    fn test_recovery_transport_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Transport(LlmError::RateLimited {
            retry_after_ms: Some(1000),
        });
        assert!(matches!(engine.handle(&err), RecoveryAction::Abort));
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        assert!(matches!(
            engine.handle(&AgentError::Cancelled),
            RecoveryAction::Abort
        ));
    }
}
