//! Mock LLM 客户端（用于测试与无 API Key 时的本地运行，无需网络）
//!
//! 按脚本顺序返回预设回复；脚本耗尽后交给 responder，否则回显最后一条用户消息作为最终答案。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};

type Reply = Result<Option<ChatResponse>, LlmError>;
type Responder = dyn Fn(&ChatRequest) -> Reply + Send + Sync;

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Reply>>,
    responder: Option<Box<Responder>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: ChatResponse) -> Self {
        self.push(Ok(Some(reply)))
    }

    /// 服务端返回无内容（无 choices）
    pub fn with_empty_reply(self) -> Self {
        self.push(Ok(None))
    }

    pub fn with_error(self, err: LlmError) -> Self {
        self.push(Err(err))
    }

    /// 脚本耗尽后根据请求动态生成回复
    pub fn with_responder(
        mut self,
        responder: impl Fn(&ChatRequest) -> Reply + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// 每次调用前的人为延迟
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, reply: Reply) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
        self
    }

    fn next_scripted(&self) -> Option<Reply> {
        self.script.lock().ok().and_then(|mut s| s.pop_front())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: &ChatRequest, _session_id: &str) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reply) = self.next_scripted() {
            return reply;
        }
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        let last_user = request.last_user_message().unwrap_or("(no input)");
        Ok(Some(ChatResponse::text(format!("Echo from Mock: {last_user}"))))
    }

    fn model(&self) -> &str {
        "mock"
    }
}
