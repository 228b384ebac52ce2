//! 工具结果缓存
//!
//! 键 = 工具名 + 规范化参数（对象键排序），与调用 id 无关。
//! 条目带 TTL 与容量上限；过期条目仍可作为降级链中的「过期缓存」候选读取。
//! 同键并发调用只执行一次（single-flight），其余等待者共享结果。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::config::CacheSection;
use crate::tools::ToolOutput;

type Shared = Arc<OnceCell<Result<ToolOutput, String>>>;

struct CacheEntry {
    output: ToolOutput,
    inserted_at: Instant,
}

/// 一次去重执行的结果
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub output: Result<ToolOutput, String>,
    /// 结果不是本次调用亲自执行得到的（命中缓存或共享了在途执行）
    pub from_cache: bool,
}

/// 规范化缓存键
pub fn cache_key(tool: &str, args: &Value) -> String {
    format!("{tool}:{}", canonical_json(args))
}

fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                Value::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), v))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    // 按键排序后重建对象，序列化结果与原始键顺序无关
    sort(value).to_string()
}

/// 结果缓存
pub struct ResultCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Shared>>,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_section(section: &CacheSection) -> Self {
        Self::new(Duration::from_secs(section.ttl_secs), section.max_entries)
    }

    /// 未过期的缓存结果
    pub async fn get(&self, key: &str) -> Option<ToolOutput> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.output.clone())
    }

    /// 任意年龄的缓存结果（降级用）
    pub async fn get_stale(&self, key: &str) -> Option<ToolOutput> {
        self.entries.read().await.get(key).map(|e| e.output.clone())
    }

    pub async fn insert(&self, key: String, output: ToolOutput) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                output,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 命中则直接返回；否则同键并发调用只执行一次 `run`，成功结果写入缓存
    pub async fn run_deduplicated<F, Fut>(&self, key: &str, run: F) -> CacheLookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ToolOutput, String>>,
    {
        if let Some(hit) = self.get(key).await {
            return CacheLookup {
                output: Ok(hit),
                from_cache: true,
            };
        }

        let cell: Shared = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let executed = AtomicBool::new(false);
        let output = cell
            .get_or_init(|| {
                let executed = &executed;
                async move {
                    executed.store(true, Ordering::SeqCst);
                    run().await
                }
            })
            .await
            .clone();
        let executed = executed.load(Ordering::SeqCst);

        if executed {
            if let Ok(out) = &output {
                self.insert(key.to_string(), out.clone()).await;
            }
            let mut inflight = self.inflight.lock().await;
            if inflight.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                inflight.remove(key);
            }
        }

        CacheLookup {
            output,
            from_cache: !executed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cache_key_ignores_key_order() {
        let a = cache_key("search", &json!({"q": "rust", "opts": {"b": 1, "a": 2}}));
        let b = cache_key("search", &json!({"opts": {"a": 2, "b": 1}, "q": "rust"}));
        assert_eq!(a, b);
        assert_ne!(a, cache_key("other", &json!({"q": "rust"})));
    }

    #[tokio::test]
    async fn test_ttl_expiry_keeps_stale_copy() {
        let cache = ResultCache::new(Duration::from_millis(20), 8);
        cache.insert("k".into(), ToolOutput::text("v")).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.get_stale("k").await.unwrap().content, "v");
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), ToolOutput::text("1")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.insert("b".into(), ToolOutput::text("2")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.insert("c".into(), ToolOutput::text("3")).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_calls_execute_once() {
        let cache = Arc::new(ResultCache::new(Duration::from_secs(60), 8));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .run_deduplicated("same", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(ToolOutput::text("shared"))
                    })
                    .await
            }));
        }

        let mut executed = 0;
        for h in handles {
            let lookup = h.await.unwrap();
            assert_eq!(lookup.output.unwrap().content, "shared");
            if !lookup.from_cache {
                executed += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(executed, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ResultCache::new(Duration::from_secs(60), 8);
        let first = cache
            .run_deduplicated("k", || async { Err("boom".to_string()) })
            .await;
        assert!(first.output.is_err());
        let second = cache
            .run_deduplicated("k", || async { Ok(ToolOutput::text("ok")) })
            .await;
        assert!(!second.from_cache);
        assert_eq!(second.output.unwrap().content, "ok");
    }
}
