//! 远程工具来源
//!
//! 通过 RemoteToolCatalog 发现与调用远程工具；目录按 refresh 间隔重新拉取，
//! 拉取失败时记录日志并继续使用上一次的列表。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::tools::source::ToolSource;
use crate::tools::{SourceKind, Tool, ToolOutput};

/// 远程目录中的一个工具
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// 远程工具协议
#[async_trait]
pub trait RemoteToolCatalog: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, String>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutput, String>;
}

/// 远程工具在本地的代理
pub struct RemoteTool {
    spec: RemoteToolSpec,
    catalog: Arc<dyn RemoteToolCatalog>,
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.parameters.clone()
    }

    fn tags(&self) -> Vec<String> {
        self.spec.tags.clone()
    }

    fn is_read_only(&self) -> bool {
        self.spec.read_only
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        self.catalog.call_tool(&self.spec.name, args).await
    }
}

#[derive(Default)]
struct CatalogState {
    tools: HashMap<String, Arc<dyn Tool>>,
    fetched_at: Option<Instant>,
}

/// 远程来源：带 TTL 的目录缓存
pub struct RemoteSource {
    catalog: Arc<dyn RemoteToolCatalog>,
    refresh: Duration,
    state: RwLock<CatalogState>,
    refreshing: Mutex<()>,
}

impl RemoteSource {
    pub fn new(catalog: Arc<dyn RemoteToolCatalog>, refresh: Duration) -> Self {
        Self {
            catalog,
            refresh,
            state: RwLock::new(CatalogState::default()),
            refreshing: Mutex::new(()),
        }
    }

    fn is_stale(state: &CatalogState, refresh: Duration) -> bool {
        state.fetched_at.map_or(true, |t| t.elapsed() >= refresh)
    }

    async fn ensure_fresh(&self) {
        if !Self::is_stale(&*self.state.read().await, self.refresh) {
            return;
        }
        let _guard = self.refreshing.lock().await;
        // 等锁期间可能已被其他调用刷新
        if !Self::is_stale(&*self.state.read().await, self.refresh) {
            return;
        }

        let fetched = self.catalog.list_tools().await;
        let mut state = self.state.write().await;
        // 失败也记录时间，保证不会比 refresh 间隔更频繁地访问远端
        state.fetched_at = Some(Instant::now());
        match fetched {
            Ok(specs) => {
                tracing::debug!(endpoint = self.catalog.endpoint(), count = specs.len(), "remote tool catalog refreshed");
                state.tools = specs
                    .into_iter()
                    .map(|spec| {
                        let name = spec.name.clone();
                        let tool: Arc<dyn Tool> = Arc::new(RemoteTool {
                            spec,
                            catalog: Arc::clone(&self.catalog),
                        });
                        (name, tool)
                    })
                    .collect();
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = self.catalog.endpoint(),
                    error = %e,
                    cached = state.tools.len(),
                    "remote tool catalog refresh failed, serving cached list"
                );
            }
        }
    }
}

#[async_trait]
impl ToolSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.ensure_fresh().await;
        self.state.read().await.tools.get(name).cloned()
    }

    async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.ensure_fresh().await;
        self.state.read().await.tools.values().cloned().collect()
    }
}

#[derive(Debug, Deserialize)]
struct HttpCallReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP 目录：`GET {endpoint}/tools` 列出，`POST {endpoint}/tools/{name}` 调用
pub struct HttpToolCatalog {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpToolCatalog {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("http client: {e}"))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl RemoteToolCatalog for HttpToolCatalog {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, String> {
        let resp = self
            .client
            .get(format!("{}/tools", self.endpoint))
            .send()
            .await
            .map_err(|e| format!("list tools: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("list tools: http {}", resp.status()));
        }
        resp.json::<Vec<RemoteToolSpec>>()
            .await
            .map_err(|e| format!("list tools: invalid body: {e}"))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutput, String> {
        let resp = self
            .client
            .post(format!("{}/tools/{}", self.endpoint, name))
            .json(&args)
            .send()
            .await
            .map_err(|e| format!("call {name}: {e}"))?;
        let status = resp.status();
        let reply: HttpCallReply = resp
            .json()
            .await
            .map_err(|e| format!("call {name}: invalid body (http {status}): {e}"))?;
        if let Some(err) = reply.error {
            return Err(err);
        }
        if !status.is_success() {
            return Err(format!("call {name}: http {status}"));
        }
        Ok(ToolOutput {
            content: reply.content,
            data: reply.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyCatalog {
        fail: AtomicBool,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl RemoteToolCatalog for FlakyCatalog {
        fn endpoint(&self) -> &str {
            "test://flaky"
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, String> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err("unreachable".into());
            }
            Ok(vec![RemoteToolSpec {
                name: "weather".into(),
                description: "remote weather".into(),
                parameters: empty_object_schema(),
                tags: vec!["net".into()],
                read_only: true,
            }])
        }

        async fn call_tool(&self, name: &str, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text(format!("{name}: sunny")))
        }
    }

    fn catalog() -> Arc<FlakyCatalog> {
        Arc::new(FlakyCatalog {
            fail: AtomicBool::new(false),
            lists: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_refresh_interval_is_respected() {
        let cat = catalog();
        let source = RemoteSource::new(cat.clone(), Duration::from_secs(60));
        assert!(source.lookup("weather").await.is_some());
        assert!(source.lookup("weather").await.is_some());
        assert_eq!(source.tools().await.len(), 1);
        assert_eq!(cat.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_list_served_when_refresh_fails() {
        let cat = catalog();
        let source = RemoteSource::new(cat.clone(), Duration::from_millis(10));
        let tool = source.lookup("weather").await.unwrap();
        assert!(tool.is_read_only());

        cat.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let tool = source.lookup("weather").await.unwrap();
        assert_eq!(cat.lists.load(Ordering::SeqCst), 2);
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out.content, "weather: sunny");
    }

    #[tokio::test]
    async fn test_first_fetch_failure_yields_empty() {
        let cat = catalog();
        cat.fail.store(true, Ordering::SeqCst);
        let source = RemoteSource::new(cat.clone(), Duration::from_secs(60));
        assert!(source.lookup("weather").await.is_none());
        assert!(source.lookup("weather").await.is_none());
        assert_eq!(cat.lists.load(Ordering::SeqCst), 1);
    }
}
