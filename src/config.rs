//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SUBTASK__WORKER_CAP=4`）。
//! 配置对象在 Engine / Registry 构建之后视为只读。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub subtask: SubTaskSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 任务工作目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub deepseek: LlmModelSection,
    pub openai: LlmModelSection,
    pub timeouts: LlmTimeoutsSection,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            deepseek: LlmModelSection::default(),
            openai: LlmModelSection::default(),
            timeouts: LlmTimeoutsSection::default(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmModelSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [llm.retry] 段：最大尝试次数与退避策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// fixed（默认）/ exponential
    pub strategy: String,
    pub max_backoff_ms: u64,
    /// 5xx 响应正文含这些片段时视为「请求过大」，不重试
    pub too_large_markers: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            strategy: "fixed".to_string(),
            max_backoff_ms: 8_000,
            too_large_markers: vec![
                "request too large".into(),
                "payload too large".into(),
                "request entity too large".into(),
            ],
        }
    }
}

/// [engine] 段：迭代上限、工具并发、预分析
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_iterations: usize,
    /// 同一轮内普通工具调用的并发上限
    pub tool_parallelism: usize,
    pub pre_analysis: bool,
    /// 发送给模型的最近消息条数
    pub prompt_window: usize,
    /// 取消后给在途工具 / 子任务返回结果的宽限时间（毫秒）
    pub cancel_grace_ms: u64,
    pub system_prompt: Option<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tool_parallelism: 4,
            pre_analysis: false,
            prompt_window: 40,
            cancel_grace_ms: 2_000,
            system_prompt: None,
        }
    }
}

impl EngineSection {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// [tools] 段：文件系统根、工具超时、缓存、SLA、远程目录、降级链、命令插件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub filesystem_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 动态来源重新询问 provider 的间隔（秒）
    pub dynamic_refresh_secs: u64,
    pub cache: CacheSection,
    pub sla: SlaSection,
    pub remote: RemoteSection,
    pub degradation: DegradationSection,
    pub plugins: Vec<PluginEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            filesystem_root: None,
            tool_timeout_secs: 30,
            dynamic_refresh_secs: 30,
            cache: CacheSection::default(),
            sla: SlaSection::default(),
            remote: RemoteSection::default(),
            degradation: DegradationSection::default(),
            plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 256,
        }
    }
}

/// [tools.sla] 段：滑动窗口大小与不健康判定阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlaSection {
    pub window: usize,
    pub failure_threshold: f64,
    pub min_samples: usize,
}

impl Default for SlaSection {
    fn default() -> Self {
        Self {
            window: 100,
            failure_threshold: 0.5,
            min_samples: 5,
        }
    }
}

/// [tools.remote] 段：远程工具目录（HTTP）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub endpoint: Option<String>,
    pub refresh_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            refresh_secs: 60,
            timeout_secs: 15,
        }
    }
}

/// [tools.degradation] 段：每个工具的有序降级候选
///
/// 候选写法：`"cache"` 表示过期缓存，`"ask_user"` 表示请求用户介入，其余视为工具名。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DegradationSection {
    pub fallbacks: HashMap<String, Vec<String>>,
    pub enable_user_prompt: bool,
    pub max_fallback_attempts: usize,
}

impl Default for DegradationSection {
    fn default() -> Self {
        Self {
            fallbacks: HashMap::new(),
            enable_user_prompt: false,
            max_fallback_attempts: 3,
        }
    }
}

/// [[tools.plugins]]：以外部程序实现的工具，参数模板中的 {{key}} 由调用参数替换
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_plugin_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub read_only: bool,
}

fn default_plugin_timeout_secs() -> u64 {
    30
}

/// [subtask] 段：子任务并发与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubTaskSection {
    pub worker_cap: usize,
    pub task_timeout_secs: u64,
    /// 子任务引擎的迭代上限
    pub max_iterations: usize,
}

impl Default for SubTaskSection {
    fn default() -> Self {
        Self {
            worker_cap: 3,
            task_timeout_secs: 120,
            max_iterations: 15,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
