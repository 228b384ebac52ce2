//! LLM 调用重试
//!
//! 永久错误（鉴权、非法请求、上下文超长、请求过大）立即返回；
//! 可重试错误（超时、5xx、限流、连接重置、空回复）按退避策略重试，直到 max_attempts。
//! 取消令牌在调用中与退避等待中都会被观察。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetrySection;
use crate::llm::{ChatRequest, ChatResponse, ErrorClass, LlmClient, LlmError};

/// 退避策略
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// 第 `attempt` 次失败后的等待时长（attempt 从 1 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// 5xx 正文含这些片段时按「请求过大」处理（永久）
    pub too_large_markers: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_section(&RetrySection::default())
    }
}

impl RetryConfig {
    pub fn from_section(section: &RetrySection) -> Self {
        let base = Duration::from_millis(section.backoff_ms);
        let backoff = match section.strategy.as_str() {
            "exponential" => Backoff::Exponential {
                base,
                max: Duration::from_millis(section.max_backoff_ms.max(section.backoff_ms)),
            },
            "fixed" => Backoff::Fixed(base),
            other => {
                tracing::warn!(strategy = other, "unknown retry strategy, using fixed backoff");
                Backoff::Fixed(base)
            }
        };
        Self {
            max_attempts: section.max_attempts.max(1),
            backoff,
            too_large_markers: section.too_large_markers.clone(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn classify(&self, err: &LlmError) -> ErrorClass {
        if let LlmError::Status { code, message } = err {
            let lower = message.to_lowercase();
            if (500..600).contains(code)
                && self
                    .too_large_markers
                    .iter()
                    .any(|m| lower.contains(&m.to_lowercase()))
            {
                return ErrorClass::Permanent;
            }
        }
        err.class()
    }
}

/// 带重试的调用；返回最后一次错误或首个成功回复
pub async fn call_with_retry(
    client: &dyn LlmClient,
    cancel: &CancellationToken,
    request: &ChatRequest,
    session_id: &str,
    config: &RetryConfig,
) -> Result<ChatResponse, LlmError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            r = client.chat(request, session_id) => r,
        };

        let err = match outcome {
            Ok(Some(response)) => {
                if attempt > 1 {
                    tracing::info!(attempt, model = client.model(), "llm call succeeded after retry");
                }
                return Ok(response);
            }
            Ok(None) => LlmError::EmptyResponse,
            Err(e) => e,
        };

        if config.classify(&err) == ErrorClass::Permanent {
            tracing::warn!(attempt, error = %err, "llm call failed with permanent error");
            return Err(err);
        }
        if attempt >= config.max_attempts {
            tracing::warn!(attempt, error = %err, "llm call failed, retries exhausted");
            return Err(err);
        }

        let mut delay = config.backoff.delay(attempt);
        if let LlmError::RateLimited {
            retry_after_ms: Some(ms),
        } = &err
        {
            delay = delay.max(Duration::from_millis(*ms));
        }
        tracing::warn!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "llm call failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// 包装任意 LlmClient，对外提供带重试与取消的 call
#[derive(Clone)]
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }

    pub async fn call(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        session_id: &str,
    ) -> Result<ChatResponse, LlmError> {
        call_with_retry(self.inner.as_ref(), cancel, request, session_id, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::Message;
    use std::time::Instant;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff(Backoff::Fixed(Duration::from_millis(5)))
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user("hi")])
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(30), Duration::from_millis(350));
    }

    #[test]
    fn test_default_backoff_is_fixed() {
        assert_eq!(
            RetryConfig::default().backoff,
            Backoff::Fixed(Duration::from_millis(500))
        );

        let mut section = RetrySection {
            strategy: "exponential".into(),
            ..RetrySection::default()
        };
        assert!(matches!(
            RetryConfig::from_section(&section).backoff,
            Backoff::Exponential { .. }
        ));

        section.strategy = "jittered".into();
        assert_eq!(
            RetryConfig::from_section(&section).backoff,
            Backoff::Fixed(Duration::from_millis(500))
        );
    }

    #[tokio::test]
    async fn test_permanent_error_returns_after_one_attempt() {
        let mock = MockLlmClient::new()
            .with_error(LlmError::Authentication("bad key".into()))
            .with_reply(ChatResponse::text("never"));
        let cancel = CancellationToken::new();
        let err = call_with_retry(&mock, &cancel, &request(), "s", &fast_config(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Authentication(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retriable_error_uses_all_attempts() {
        let mut mock = MockLlmClient::new();
        for _ in 0..4 {
            mock = mock.with_error(LlmError::RateLimited {
                retry_after_ms: None,
            });
        }
        let cancel = CancellationToken::new();
        let err = call_with_retry(&mock, &cancel, &request(), "s", &fast_config(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mock = MockLlmClient::new()
            .with_error(LlmError::Status {
                code: 503,
                message: "unavailable".into(),
            })
            .with_empty_reply()
            .with_reply(ChatResponse::text("done"));
        let cancel = CancellationToken::new();
        let resp = call_with_retry(&mock, &cancel, &request(), "s", &fast_config(3))
            .await
            .unwrap();
        assert_eq!(resp.content, "done");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_too_large_marker_is_permanent() {
        let mock = MockLlmClient::new().with_error(LlmError::Status {
            code: 500,
            message: "Request too large for model".into(),
        });
        let cancel = CancellationToken::new();
        let err = call_with_retry(&mock, &cancel, &request(), "s", &fast_config(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Status { code: 500, .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let mock = MockLlmClient::new()
            .with_error(LlmError::Timeout)
            .with_reply(ChatResponse::text("late"));
        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::Fixed(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = call_with_retry(&mock, &cancel, &request(), "s", &config)
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(mock.call_count(), 1);
    }
}
