//! Hive - 自主任务执行内核
//!
//! 模块划分：
//! - **agent**: 从配置装配运行时（LLM、工具注册表、任务引擎）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、任务状态与上下文、并发调度、子任务协调
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与重试包装
//! - **memory**: 对话消息与会话存储
//! - **observability**: 日志初始化
//! - **react**: Planner、工具分派、进度事件、任务执行主循环
//! - **tools**: 工具注册表（静态 / 动态 / 远程）、缓存、SLA、降级链、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{create_runtime, AgentRuntime};
pub use crate::core::{AgentError, TaskFailure, TaskResult};
pub use react::{EngineConfig, ProgressEvent, ProgressSink, TaskEngine};
