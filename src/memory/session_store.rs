//! 会话存储抽象层
//!
//! 引擎在任务开始时读取会话历史，执行过程中只追加消息。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::conversation::{ConversationMemory, Message};

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 获取会话全部历史（不存在时为空）
    async fn history(&self, session_id: &str) -> Vec<Message>;

    /// 追加消息到会话
    async fn append(&self, session_id: &str, messages: Vec<Message>);
}

/// 内存会话存储
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ConversationMemory>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 活跃会话数
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn history(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.messages().to_vec())
            .unwrap_or_default()
    }

    async fn append(&self, session_id: &str, messages: Vec<Message>) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .extend(messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_history() {
        let store = InMemorySessionStore::new();
        assert!(store.history("s1").await.is_empty());

        store.append("s1", vec![Message::user("hi")]).await;
        store.append("s1", vec![Message::assistant("hello")]).await;
        store.append("s2", vec![Message::user("other")]).await;

        let history = store.history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hello");
        assert_eq!(store.session_count().await, 2);
    }
}
