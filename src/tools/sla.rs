//! 工具 SLA 统计
//!
//! 每个工具一个滑动窗口（默认 100 个样本）：成功率、失败率、平均 / P95 延迟、缓存命中数。
//! 缓存命中记为零延迟的成功样本。统计结果供降级链判断「不健康」与候选排序。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::SlaSection;

/// 单次执行样本
#[derive(Debug, Clone)]
pub struct SlaSample {
    pub latency: Duration,
    pub success: bool,
    pub cache_hit: bool,
    pub timestamp_ms: i64,
}

/// 某工具窗口内的聚合统计
#[derive(Debug, Clone, Serialize)]
pub struct SlaStats {
    pub tool: String,
    pub call_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub cache_hits: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub mean_latency: Duration,
    pub p95_latency: Duration,
}

impl SlaStats {
    /// 健康分 0.0..=1.0：成功率按平均延迟（秒）打折
    pub fn health_score(&self) -> f64 {
        let latency_secs = self.mean_latency.as_secs_f64();
        self.success_rate / (1.0 + latency_secs)
    }
}

#[derive(Debug, Clone)]
pub struct SlaConfig {
    pub window: usize,
    pub failure_threshold: f64,
    pub min_samples: usize,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self::from_section(&SlaSection::default())
    }
}

impl SlaConfig {
    pub fn from_section(section: &SlaSection) -> Self {
        Self {
            window: section.window.max(1),
            failure_threshold: section.failure_threshold,
            min_samples: section.min_samples.max(1),
        }
    }
}

/// SLA 跟踪器（多任务共享，通过 Arc 注入）
#[derive(Debug, Default)]
pub struct SlaTracker {
    config: SlaConfig,
    windows: RwLock<HashMap<String, VecDeque<SlaSample>>>,
}

impl SlaTracker {
    pub fn new(config: SlaConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, tool: &str, sample: SlaSample) {
        let mut windows = self.windows.write().await;
        let window = windows.entry(tool.to_string()).or_default();
        window.push_back(sample);
        while window.len() > self.config.window {
            window.pop_front();
        }
    }

    pub async fn record_execution(&self, tool: &str, latency: Duration, success: bool) {
        self.record(
            tool,
            SlaSample {
                latency,
                success,
                cache_hit: false,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            },
        )
        .await;
    }

    pub async fn record_cache_hit(&self, tool: &str) {
        self.record(
            tool,
            SlaSample {
                latency: Duration::ZERO,
                success: true,
                cache_hit: true,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            },
        )
        .await;
    }

    pub async fn stats(&self, tool: &str) -> Option<SlaStats> {
        let windows = self.windows.read().await;
        let window = windows.get(tool).filter(|w| !w.is_empty())?;

        let call_count = window.len();
        let success_count = window.iter().filter(|s| s.success).count();
        let cache_hits = window.iter().filter(|s| s.cache_hit).count();
        let total: Duration = window.iter().map(|s| s.latency).sum();

        let mut latencies: Vec<Duration> = window.iter().map(|s| s.latency).collect();
        latencies.sort();
        let p95_index = ((call_count as f64 * 0.95).ceil() as usize).clamp(1, call_count) - 1;

        Some(SlaStats {
            tool: tool.to_string(),
            call_count,
            success_count,
            failure_count: call_count - success_count,
            cache_hits,
            success_rate: success_count as f64 / call_count as f64,
            failure_rate: (call_count - success_count) as f64 / call_count as f64,
            mean_latency: total / call_count as u32,
            p95_latency: latencies[p95_index],
        })
    }

    /// 样本足够且失败率达到阈值
    pub async fn is_unhealthy(&self, tool: &str) -> bool {
        match self.stats(tool).await {
            Some(s) => {
                s.call_count >= self.config.min_samples
                    && s.failure_rate >= self.config.failure_threshold
            }
            None => false,
        }
    }

    /// 无样本的工具视为满分
    pub async fn health_score(&self, tool: &str) -> f64 {
        self.stats(tool)
            .await
            .map(|s| s.health_score())
            .unwrap_or(1.0)
    }

    pub async fn snapshot(&self) -> Vec<SlaStats> {
        let names: Vec<String> = self.windows.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(s) = self.stats(&name).await {
                out.push(s);
            }
        }
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }
}
