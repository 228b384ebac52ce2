//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::chat。
//! 传输错误统一为 LlmError，并自带「可重试 / 永久」分类，供 RetryingLlmClient 使用。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;
use crate::tools::{ToolCallRequest, ToolDefinition};

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }
}

/// 一次对话请求：有序消息 + 可用工具定义
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// 最后一条用户消息的内容
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::memory::Role::User))
            .map(|m| m.content.as_str())
    }
}

/// 模型回复：文本、零或多个工具调用、用量
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCallRequest) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// 错误分类：永久错误立即返回，可重试错误按退避策略重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent,
    Retriable,
}

/// LLM 传输错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("http status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request too large: {0}")]
    RequestTooLarge(String),

    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),

    #[error("empty response from model")]
    EmptyResponse,

    #[error("request cancelled")]
    Cancelled,

    #[error("llm error: {0}")]
    Other(String),
}

fn status_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?:^|\bstatus(?:\s+code)?|\bhttp(?:/[\d.]+)?|\berror)[\s:=(]*([45]\d\d)\b").ok()
        })
        .as_ref()
}

fn is_http_status(code: u16) -> bool {
    matches!(code, 400..=451 | 500..=511)
}

impl LlmError {
    /// 默认分类（不含 RetryConfig 中的「请求过大」标记）
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::RateLimited { .. }
            | LlmError::Timeout
            | LlmError::Connection(_)
            | LlmError::EmptyResponse => ErrorClass::Retriable,
            LlmError::Status { code, .. } => match code {
                408 | 429 => ErrorClass::Retriable,
                500..=599 => ErrorClass::Retriable,
                _ => ErrorClass::Permanent,
            },
            LlmError::Authentication(_)
            | LlmError::InvalidRequest(_)
            | LlmError::RequestTooLarge(_)
            | LlmError::ContextWindowExceeded(_)
            | LlmError::Cancelled
            | LlmError::Other(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Retriable
    }

    /// 由 HTTP 状态码与响应正文构造
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 | 403 => LlmError::Authentication(message),
            413 => LlmError::RequestTooLarge(message),
            429 => LlmError::RateLimited {
                retry_after_ms: None,
            },
            400 if is_context_overflow(&message) => LlmError::ContextWindowExceeded(message),
            400 | 404 | 422 => LlmError::InvalidRequest(message),
            _ => LlmError::Status { code, message },
        }
    }

    /// 仅有错误文本时（HTTP 客户端报错）按内容分类
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if is_context_overflow(&lower) {
            return LlmError::ContextWindowExceeded(message);
        }
        if lower.contains("rate limit") || lower.contains("too many requests") {
            return LlmError::RateLimited {
                retry_after_ms: None,
            };
        }
        if lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("forbidden")
        {
            return LlmError::Authentication(message);
        }
        // 传输层错误先判定：URL 中的端口号不能被当作状态码
        if lower.contains("timed out") || lower.contains("timeout") || lower.contains("deadline") {
            return LlmError::Timeout;
        }
        if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("broken pipe")
            || lower.contains("dns")
            || lower.contains("network")
        {
            return LlmError::Connection(message);
        }
        if let Some(code) = status_pattern()
            .and_then(|p| p.captures(&lower))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|code| is_http_status(*code))
        {
            return LlmError::from_status(code, message);
        }
        if lower.contains("bad request") || lower.contains("not found") {
            return LlmError::InvalidRequest(message);
        }
        LlmError::Other(message)
    }
}

fn is_context_overflow(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
}

/// LLM 客户端 trait
///
/// `Ok(None)` 表示服务端返回了空回复（无 choices），由重试层视为可重试。
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        request: &ChatRequest,
        session_id: &str,
    ) -> Result<Option<ChatResponse>, LlmError>;

    /// 模型名（日志用）
    fn model(&self) -> &str {
        "unknown"
    }
}
