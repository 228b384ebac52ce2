//! 工具来源：静态表、动态 provider、远程目录
//!
//! 注册表按 静态 → 动态 → 远程 的优先级查找；同名时高优先级来源生效。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::tools::{SourceKind, Tool};

/// 工具来源
#[async_trait]
pub trait ToolSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// 按名查找；来源不可用时返回 None
    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>>;

    /// 当前可用的全部工具
    async fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

/// 静态工具表：启动时注册，之后只读
#[derive(Default)]
pub struct StaticSource {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名返回 false 且不覆盖
    pub async fn insert(&self, tool: Arc<dyn Tool>) -> bool {
        let mut tools = self.tools.write().await;
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            return false;
        }
        tools.insert(name, tool);
        true
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}

#[async_trait]
impl ToolSource for StaticSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.read().await.values().cloned().collect()
    }
}

/// 动态工具提供者：可随时变为不可用，其工具随之从视图中消失
#[async_trait]
pub trait DynamicToolProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn provide(&self) -> Vec<Arc<dyn Tool>>;
}

struct ProviderSnapshot {
    taken_at: Instant,
    available: bool,
    tools: HashMap<String, Arc<dyn Tool>>,
}

/// 动态来源：每个 provider 的工具列表与可用性按刷新间隔重新询问
pub struct DynamicSource {
    providers: Vec<Arc<dyn DynamicToolProvider>>,
    refresh: Duration,
    snapshots: RwLock<HashMap<String, ProviderSnapshot>>,
    /// 串行化重新询问，保证同一刷新间隔内每个 provider 只被询问一次
    refreshing: Mutex<()>,
}

impl DynamicSource {
    pub fn new(refresh: Duration) -> Self {
        Self {
            providers: Vec::new(),
            refresh,
            snapshots: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(()),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn DynamicToolProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    async fn is_fresh(&self, provider: &Arc<dyn DynamicToolProvider>) -> bool {
        self.snapshots
            .read()
            .await
            .get(provider.id())
            .is_some_and(|s| s.taken_at.elapsed() < self.refresh)
    }

    async fn refresh_if_stale(&self, provider: &Arc<dyn DynamicToolProvider>) {
        if self.is_fresh(provider).await {
            return;
        }
        let _guard = self.refreshing.lock().await;
        // 等锁期间可能已被其他调用刷新
        if self.is_fresh(provider).await {
            return;
        }

        let available = provider.is_available().await;
        let tools = if available {
            provider
                .provide()
                .await
                .into_iter()
                .map(|t| (t.name().to_string(), t))
                .collect()
        } else {
            tracing::debug!(provider = provider.id(), "dynamic tool provider unavailable");
            HashMap::new()
        };

        self.snapshots.write().await.insert(
            provider.id().to_string(),
            ProviderSnapshot {
                taken_at: Instant::now(),
                available,
                tools,
            },
        );
    }
}

#[async_trait]
impl ToolSource for DynamicSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Dynamic
    }

    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        for provider in &self.providers {
            self.refresh_if_stale(provider).await;
            let snapshots = self.snapshots.read().await;
            if let Some(tool) = snapshots
                .get(provider.id())
                .filter(|s| s.available)
                .and_then(|s| s.tools.get(name))
            {
                return Some(Arc::clone(tool));
            }
        }
        None
    }

    async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut out = Vec::new();
        for provider in &self.providers {
            self.refresh_if_stale(provider).await;
            let snapshots = self.snapshots.read().await;
            if let Some(s) = snapshots.get(provider.id()).filter(|s| s.available) {
                out.extend(s.tools.values().cloned());
            }
        }
        out
    }
}

/// 固定工具集的 provider，可用性由开关控制（测试与进程内扩展用）
pub struct SwitchableProvider {
    id: String,
    tools: Vec<Arc<dyn Tool>>,
    available: AtomicBool,
}

impl SwitchableProvider {
    pub fn new(id: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            id: id.into(),
            tools,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl DynamicToolProvider for SwitchableProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn provide(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use std::sync::atomic::AtomicUsize;

    /// 记录被询问次数的 provider；可用性检查故意放慢以制造并发窗口
    struct CountingProvider {
        checks: AtomicUsize,
    }

    #[async_trait]
    impl DynamicToolProvider for CountingProvider {
        fn id(&self) -> &str {
            "counting"
        }

        async fn is_available(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            true
        }

        async fn provide(&self) -> Vec<Arc<dyn Tool>> {
            vec![Arc::new(EchoTool)]
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_query_provider_once_per_interval() {
        let provider = Arc::new(CountingProvider {
            checks: AtomicUsize::new(0),
        });
        let source = Arc::new(
            DynamicSource::new(Duration::from_secs(60)).with_provider(provider.clone()),
        );

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let source = Arc::clone(&source);
                tokio::spawn(async move { source.lookup("echo").await.is_some() })
            })
            .collect();
        for found in futures_util::future::join_all(lookups).await {
            assert!(found.unwrap());
        }
        assert_eq!(provider.checks.load(Ordering::SeqCst), 1);

        assert!(source.lookup("missing").await.is_none());
        assert_eq!(source.tools().await.len(), 1);
        assert_eq!(provider.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_provider_hides_tools_after_refresh() {
        let provider = Arc::new(SwitchableProvider::new("switch", vec![Arc::new(EchoTool)]));
        let source = DynamicSource::new(Duration::ZERO).with_provider(provider.clone());
        assert!(source.lookup("echo").await.is_some());

        provider.set_available(false);
        assert!(source.lookup("echo").await.is_none());
        assert!(source.tools().await.is_empty());
    }
}
