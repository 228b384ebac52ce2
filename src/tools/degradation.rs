//! 降级链配置
//!
//! 每个工具一组有序候选：过期缓存、替代工具、请求用户介入。
//! 候选数受 max_fallback_attempts 限制；执行逻辑在 ToolRegistry::execute 中。

use std::collections::HashMap;
use std::fmt;

use crate::config::DegradationSection;

/// max_fallback_attempts 为 0 时使用的默认值
pub const DEFAULT_MAX_FALLBACK_ATTEMPTS: usize = 3;

/// 结果元数据键
pub const META_DEGRADED_FROM: &str = "degraded_from";
pub const META_DEGRADED_TO: &str = "degraded_to";
pub const META_USER_PROMPT: &str = "user_prompt";

/// 降级候选
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// 同键的缓存结果（可已过期）
    StaleCache,
    /// 替代工具，使用相同参数
    Tool(String),
    /// 返回「请用户决定」的提示结果
    AskUser,
}

impl Fallback {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "cache" | "stale_cache" => Fallback::StaleCache,
            "ask_user" | "user" => Fallback::AskUser,
            name => Fallback::Tool(name.to_string()),
        }
    }

    /// 写入 degraded_to 的标签
    pub fn label(&self) -> &str {
        match self {
            Fallback::StaleCache => "cache",
            Fallback::Tool(name) => name,
            Fallback::AskUser => "ask_user",
        }
    }
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct DegradationConfig {
    pub fallbacks: HashMap<String, Vec<Fallback>>,
    pub enable_user_prompt: bool,
    pub max_fallback_attempts: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            fallbacks: HashMap::new(),
            enable_user_prompt: false,
            max_fallback_attempts: DEFAULT_MAX_FALLBACK_ATTEMPTS,
        }
    }
}

impl DegradationConfig {
    pub fn from_section(section: &DegradationSection) -> Self {
        Self {
            fallbacks: section
                .fallbacks
                .iter()
                .map(|(tool, chain)| {
                    (
                        tool.clone(),
                        chain.iter().map(|c| Fallback::parse(c)).collect(),
                    )
                })
                .collect(),
            enable_user_prompt: section.enable_user_prompt,
            max_fallback_attempts: section.max_fallback_attempts,
        }
    }

    pub fn with_fallbacks(mut self, tool: impl Into<String>, chain: Vec<Fallback>) -> Self {
        self.fallbacks.insert(tool.into(), chain);
        self
    }

    pub fn with_user_prompt(mut self, enabled: bool) -> Self {
        self.enable_user_prompt = enabled;
        self
    }
}

/// 降级链
#[derive(Debug, Clone, Default)]
pub struct DegradationChain {
    config: DegradationConfig,
}

impl DegradationChain {
    pub fn new(mut config: DegradationConfig) -> Self {
        if config.max_fallback_attempts == 0 {
            config.max_fallback_attempts = DEFAULT_MAX_FALLBACK_ATTEMPTS;
        }
        Self { config }
    }

    /// 工具的有序候选：配置顺序、去掉自身、截断到上限；
    /// 开启用户提示且链中没有 AskUser 时补在末尾（不占上限）
    pub fn candidates(&self, tool: &str) -> Vec<Fallback> {
        let mut chain: Vec<Fallback> = self
            .config
            .fallbacks
            .get(tool)
            .map(|c| {
                c.iter()
                    .filter(|f| !matches!(f, Fallback::Tool(name) if name == tool))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chain.truncate(self.config.max_fallback_attempts);

        if !chain.contains(&Fallback::AskUser) {
            if self.config.enable_user_prompt {
                chain.push(Fallback::AskUser);
            }
        } else if !self.config.enable_user_prompt {
            chain.retain(|f| *f != Fallback::AskUser);
        }
        chain
    }

    pub fn has_fallbacks(&self, tool: &str) -> bool {
        !self.candidates(tool).is_empty()
    }
}

/// AskUser 候选返回给模型的文本
pub fn user_prompt_message(tool: &str, error: &str) -> String {
    format!(
        "Tool '{tool}' is currently unavailable ({error}). \
         Ask the user how to proceed, or continue without this tool."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_candidates() {
        assert_eq!(Fallback::parse("cache"), Fallback::StaleCache);
        assert_eq!(Fallback::parse("ask_user"), Fallback::AskUser);
        assert_eq!(Fallback::parse("grep"), Fallback::Tool("grep".into()));
    }

    #[test]
    fn test_candidates_truncated_and_self_removed() {
        let config = DegradationConfig {
            max_fallback_attempts: 2,
            ..Default::default()
        }
        .with_fallbacks(
            "search",
            vec![
                Fallback::Tool("search".into()),
                Fallback::Tool("a".into()),
                Fallback::StaleCache,
                Fallback::Tool("b".into()),
            ],
        );
        let chain = DegradationChain::new(config);
        assert_eq!(
            chain.candidates("search"),
            vec![Fallback::Tool("a".into()), Fallback::StaleCache]
        );
        assert!(!chain.has_fallbacks("other"));
    }

    #[test]
    fn test_user_prompt_toggle() {
        let base = DegradationConfig::default()
            .with_fallbacks("x", vec![Fallback::AskUser, Fallback::StaleCache]);
        let disabled = DegradationChain::new(base.clone());
        assert_eq!(disabled.candidates("x"), vec![Fallback::StaleCache]);

        let enabled = DegradationChain::new(base.with_user_prompt(true));
        assert_eq!(
            enabled.candidates("x"),
            vec![Fallback::AskUser, Fallback::StaleCache]
        );
        assert_eq!(enabled.candidates("y"), vec![Fallback::AskUser]);
    }

    #[test]
    fn test_zero_max_attempts_uses_default() {
        let config = DegradationConfig {
            max_fallback_attempts: 0,
            ..Default::default()
        }
        .with_fallbacks(
            "t",
            (0..5).map(|i| Fallback::Tool(format!("t{i}"))).collect(),
        );
        let chain = DegradationChain::new(config);
        assert_eq!(chain.candidates("t").len(), DEFAULT_MAX_FALLBACK_ATTEMPTS);
    }
}
