//! Headless 运行时装配
//!
//! 从 AppConfig 构建 LLM 客户端、工具注册表（静态 / 动态插件 / 远程目录）、执行器与任务引擎，
//! 供 CLI 或其它前端直接调用 run_goal。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, TaskFailure, TaskResult};
use crate::llm::{
    create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient, RetryConfig,
    RetryingLlmClient,
};
use crate::memory::{InMemorySessionStore, SessionStore};
use crate::react::{EngineConfig, Planner, ProgressSink, TaskEngine, DEFAULT_SYSTEM_PROMPT};
use crate::tools::{
    CatTool, DegradationConfig, DynamicSource, EchoTool, HttpToolCatalog, LsTool, PluginProvider,
    RemoteSource, ResultCache, SlaConfig, SlaTracker, ToolExecutor, ToolRegistry,
};

/// 根据配置与环境变量选择 LLM 后端；没有可用 Key 时使用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.timeouts.request.max(1));
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::new());
    }

    if has_deepseek_key || (provider == "deepseek" && has_openai_key) {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!(model = %model, "Using DeepSeek LLM");
        Arc::new(
            create_deepseek_client(Some(&model), cfg.llm.base_url.as_deref())
                .with_request_timeout(timeout),
        )
    } else if has_openai_key {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!(model = %model, "Using OpenAI LLM");
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, None)
                .with_request_timeout(timeout),
        )
    } else {
        tracing::warn!("No API key set, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}

/// 工具沙箱根目录
pub fn tools_root(cfg: &AppConfig) -> PathBuf {
    cfg.tools
        .filesystem_root
        .clone()
        .unwrap_or_else(|| cfg.app.workspace())
}

/// 构建工具注册表：内置 echo / ls / cat，插件作为动态来源，配置了 endpoint 时挂上远程目录
pub async fn build_registry(cfg: &AppConfig) -> Result<ToolRegistry, AgentError> {
    let root = tools_root(cfg);
    let cache = Arc::new(ResultCache::from_section(&cfg.tools.cache));
    let sla = Arc::new(SlaTracker::new(SlaConfig::from_section(&cfg.tools.sla)));

    let mut registry = ToolRegistry::new(cache, sla)
        .with_degradation(DegradationConfig::from_section(&cfg.tools.degradation));

    if !cfg.tools.plugins.is_empty() {
        let mut dynamic =
            DynamicSource::new(Duration::from_secs(cfg.tools.dynamic_refresh_secs));
        for entry in &cfg.tools.plugins {
            dynamic = dynamic.with_provider(Arc::new(PluginProvider::new(entry, &root)));
        }
        registry = registry.with_source(Arc::new(dynamic));
    }

    if let Some(endpoint) = cfg.tools.remote.endpoint.as_deref() {
        let catalog = HttpToolCatalog::new(
            endpoint,
            Duration::from_secs(cfg.tools.remote.timeout_secs),
        )
        .map_err(AgentError::ConfigError)?;
        registry = registry.with_source(Arc::new(RemoteSource::new(
            Arc::new(catalog),
            Duration::from_secs(cfg.tools.remote.refresh_secs),
        )));
    }

    registry.register(EchoTool).await?;
    registry.register(LsTool::new(&root)).await?;
    registry.register(CatTool::new(&root)).await?;
    Ok(registry)
}

/// 运行时：引擎 + 共享注册表 + 会话存储
#[derive(Clone)]
pub struct AgentRuntime {
    pub engine: TaskEngine,
    pub registry: Arc<ToolRegistry>,
    pub store: Arc<dyn SessionStore>,
}

impl AgentRuntime {
    /// 执行一个目标（新会话）
    pub async fn run_goal(
        &self,
        cancel: &CancellationToken,
        goal: &str,
        sink: Option<ProgressSink>,
    ) -> Result<TaskResult, TaskFailure> {
        self.engine.execute(cancel, goal, sink).await
    }

    /// 在已有会话中执行目标
    pub async fn run_in_session(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        goal: &str,
        sink: Option<ProgressSink>,
    ) -> Result<TaskResult, TaskFailure> {
        self.engine
            .execute_in_session(cancel, session_id, goal, sink)
            .await
    }
}

/// 从配置创建运行时
pub async fn create_runtime(cfg: &AppConfig) -> Result<AgentRuntime, AgentError> {
    let llm = create_llm_from_config(cfg);
    let registry = build_registry(cfg).await?;
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    Ok(create_runtime_with(cfg, llm, registry, store))
}

/// 用给定的 LLM、注册表、会话存储创建运行时（测试与嵌入场景）
pub fn create_runtime_with(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: ToolRegistry,
    store: Arc<dyn SessionStore>,
) -> AgentRuntime {
    let registry = Arc::new(registry);
    let executor = ToolExecutor::new(Arc::clone(&registry), cfg.tools.tool_timeout_secs)
        .with_cancel_grace(cfg.engine.cancel_grace());
    let system_prompt = cfg
        .engine
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let planner = Planner::new(
        RetryingLlmClient::new(llm, RetryConfig::from_section(&cfg.llm.retry)),
        system_prompt,
    );
    let engine = TaskEngine::new(
        planner,
        executor,
        Arc::clone(&store),
        EngineConfig::from_app_config(cfg),
    );
    AgentRuntime {
        engine,
        registry,
        store,
    }
}
