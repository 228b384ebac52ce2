//! 工具注册表
//!
//! 所有工具实现 Tool trait，按来源（静态 / 动态 / 远程）分层登记；查找按 静态 → 动态 → 远程 的优先级。
//! execute 负责缓存（仅只读工具）、SLA 采样与降级链，ToolExecutor 在外层加超时、panic 隔离与取消。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::tools::cache::{cache_key, ResultCache};
use crate::tools::degradation::{
    user_prompt_message, DegradationChain, DegradationConfig, Fallback, META_DEGRADED_FROM,
    META_DEGRADED_TO, META_USER_PROMPT,
};
use crate::tools::sla::SlaTracker;
use crate::tools::source::{StaticSource, ToolSource};
use crate::tools::{SourceKind, ToolCallRequest, ToolDefinition, ToolOutput, ToolResult};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（工具调用中的 "name" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// 无副作用的工具结果可缓存、可去重
    fn is_read_only(&self) -> bool {
        false
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 工具定义（供 prompt 与 schema 使用）
pub fn definition_of(tool: &dyn Tool, source: SourceKind) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
        tags: tool.tags(),
        source,
    }
}

/// 工具注册表
pub struct ToolRegistry {
    statics: Arc<StaticSource>,
    /// 非静态来源，按优先级排列（动态在前，远程在后）
    sources: Vec<Arc<dyn ToolSource>>,
    cache: Arc<ResultCache>,
    sla: Arc<SlaTracker>,
    degradation: DegradationChain,
}

impl ToolRegistry {
    pub fn new(cache: Arc<ResultCache>, sla: Arc<SlaTracker>) -> Self {
        Self {
            statics: Arc::new(StaticSource::new()),
            sources: Vec::new(),
            cache,
            sla,
            degradation: DegradationChain::default(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        if source.kind() == SourceKind::Static {
            tracing::warn!("additional static sources are ignored; register tools instead");
            return self;
        }
        self.sources.push(source);
        self.sources.sort_by_key(|s| match s.kind() {
            SourceKind::Static => 0,
            SourceKind::Dynamic => 1,
            SourceKind::Remote => 2,
        });
        self
    }

    pub fn with_degradation(mut self, config: DegradationConfig) -> Self {
        self.degradation = DegradationChain::new(config);
        self
    }

    /// 注册静态工具；同名视为配置错误
    pub async fn register(&self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_arc(Arc::new(tool)).await
    }

    pub async fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if self.statics.insert(tool).await {
            Ok(())
        } else {
            Err(AgentError::ConfigError(format!(
                "tool registered twice: {name}"
            )))
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn sla(&self) -> &Arc<SlaTracker> {
        &self.sla
    }

    /// 按优先级解析工具
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, AgentError> {
        self.resolve_with_source(name)
            .await
            .map(|(tool, _)| tool)
    }

    async fn resolve_with_source(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn Tool>, SourceKind), AgentError> {
        if let Some(tool) = self.statics.lookup(name).await {
            return Ok((tool, SourceKind::Static));
        }
        for source in &self.sources {
            if let Some(tool) = source.lookup(name).await {
                return Ok((tool, source.kind()));
            }
        }
        Err(AgentError::ToolNotFound(name.to_string()))
    }

    /// 全部可用工具定义：同名取高优先级来源，按名称排序
    pub async fn list_all(&self) -> Vec<ToolDefinition> {
        let mut seen = HashSet::new();
        let mut defs = Vec::new();

        let mut layers = vec![(SourceKind::Static, self.statics.tools().await)];
        for source in &self.sources {
            layers.push((source.kind(), source.tools().await));
        }

        for (kind, tools) in layers {
            for tool in tools {
                if seen.insert(tool.name().to_string()) {
                    defs.push(definition_of(tool.as_ref(), kind));
                }
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.list_all().await.into_iter().map(|d| d.name).collect()
    }

    /// 动态生成工具 schema JSON（与实际可用工具一致）
    pub async fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .list_all()
            .await
            .into_iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.parameters,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 执行一次调用：解析 → （不健康时先走降级）→ 缓存 / 执行 → 失败时走降级链
    ///
    /// 不返回 Err：所有失败都体现在 ToolResult 中。
    pub async fn execute(&self, call: &ToolCallRequest, cancel: &CancellationToken) -> ToolResult {
        let mut fallbacks_tried = false;

        let primary = match self.resolve(&call.name).await {
            Ok(tool) => {
                if self.degradation.has_fallbacks(&call.name)
                    && self.sla.is_unhealthy(&call.name).await
                {
                    tracing::warn!(tool = %call.name, "tool unhealthy, trying fallbacks first");
                    fallbacks_tried = true;
                    if let Ok(result) = self.degrade(call, "tool marked unhealthy", cancel).await {
                        return result;
                    }
                }
                self.invoke(&tool, call).await
            }
            Err(e) => ToolResult::failure(call, e.to_string()),
        };

        if primary.success || fallbacks_tried {
            return primary;
        }

        let cause = primary.error.clone().unwrap_or_default();
        match self.degrade(call, &cause, cancel).await {
            Ok(result) => result,
            Err(attempted) if attempted.is_empty() => primary,
            Err(attempted) => {
                let exhausted = AgentError::DegradationExhausted {
                    tool: call.name.clone(),
                    attempted: attempted.clone(),
                    cause,
                };
                tracing::warn!(tool = %call.name, error = %exhausted, "degradation exhausted");
                primary.with_metadata("fallbacks_attempted", json!(attempted))
            }
        }
    }

    /// 真正执行工具；只读工具走缓存与 single-flight
    async fn invoke(&self, tool: &Arc<dyn Tool>, call: &ToolCallRequest) -> ToolResult {
        let start = Instant::now();

        if tool.is_read_only() {
            let key = cache_key(&call.name, &call.arguments);
            let runner = Arc::clone(tool);
            let args = call.arguments.clone();
            let lookup = self
                .cache
                .run_deduplicated(&key, move || async move { runner.execute(args).await })
                .await;

            if lookup.from_cache {
                self.sla.record_cache_hit(&call.name).await;
            } else {
                self.sla
                    .record_execution(&call.name, start.elapsed(), lookup.output.is_ok())
                    .await;
            }
            let mut result = match lookup.output {
                Ok(out) => ToolResult::success(call, out),
                Err(e) => ToolResult::failure(call, e),
            };
            result.cached = lookup.from_cache;
            return result;
        }

        let output = tool.execute(call.arguments.clone()).await;
        self.sla
            .record_execution(&call.name, start.elapsed(), output.is_ok())
            .await;
        match output {
            Ok(out) => ToolResult::success(call, out),
            Err(e) => ToolResult::failure(call, e),
        }
    }

    /// 替代工具按健康状况排序：健康的在前，保持配置顺序
    async fn ordered_candidates(&self, tool: &str) -> Vec<Fallback> {
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for candidate in self.degradation.candidates(tool) {
            match &candidate {
                Fallback::Tool(name) if self.sla.is_unhealthy(name).await => {
                    unhealthy.push(candidate)
                }
                _ => healthy.push(candidate),
            }
        }
        healthy.extend(unhealthy);
        healthy
    }

    /// 依次尝试降级候选，返回首个成功结果；全部失败时返回已尝试的候选
    async fn degrade(
        &self,
        call: &ToolCallRequest,
        cause: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, Vec<String>> {
        let mut attempted = Vec::new();

        for candidate in self.ordered_candidates(&call.name).await {
            if cancel.is_cancelled() {
                tracing::debug!(tool = %call.name, "cancelled, stop trying fallbacks");
                break;
            }
            attempted.push(candidate.label().to_string());

            let result = match &candidate {
                Fallback::StaleCache => {
                    let key = cache_key(&call.name, &call.arguments);
                    self.cache.get_stale(&key).await.map(|out| {
                        let mut r = ToolResult::success(call, out);
                        r.cached = true;
                        r
                    })
                }
                Fallback::Tool(name) => match self.resolve(name).await {
                    Ok(alt) => {
                        let alt_call =
                            ToolCallRequest::new(call.id.clone(), name.clone(), call.arguments.clone());
                        let mut r = self.invoke(&alt, &alt_call).await;
                        r.tool_name = call.name.clone();
                        r.success.then_some(r)
                    }
                    Err(_) => {
                        tracing::debug!(tool = %call.name, fallback = %name, "fallback tool not found, skipped");
                        None
                    }
                },
                Fallback::AskUser => Some(
                    ToolResult::success(call, user_prompt_message(&call.name, cause).into())
                        .with_metadata(META_USER_PROMPT, json!(true)),
                ),
            };

            if let Some(result) = result {
                tracing::info!(tool = %call.name, fallback = %candidate, "degraded tool call succeeded");
                return Ok(result
                    .with_metadata(META_DEGRADED_FROM, json!(call.name))
                    .with_metadata(META_DEGRADED_TO, json!(candidate.label())));
            }
        }
        Err(attempted)
    }
}
