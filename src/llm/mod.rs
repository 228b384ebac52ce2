//! LLM 层：客户端抽象、重试包装与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use retry::{call_with_retry, Backoff, RetryConfig, RetryingLlmClient};
pub use traits::{ChatRequest, ChatResponse, ErrorClass, LlmClient, LlmError, TokenUsage};
