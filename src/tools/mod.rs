//! 工具层：注册表（静态 / 动态 / 远程来源）、结果缓存、SLA 统计、降级链与执行器

pub mod cache;
pub mod degradation;
pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod plugin;
pub mod registry;
pub mod remote;
pub mod schema;
pub mod sla;
pub mod source;
pub mod types;

pub use cache::{cache_key, ResultCache};
pub use degradation::{DegradationChain, DegradationConfig, Fallback};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{CatTool, LsTool, SafeFs};
pub use plugin::{PluginProvider, PluginTool};
pub use registry::{Tool, ToolRegistry};
pub use remote::{HttpToolCatalog, RemoteSource, RemoteToolCatalog, RemoteToolSpec};
pub use schema::tool_call_schema_json;
pub use sla::{SlaConfig, SlaStats, SlaTracker};
pub use source::{DynamicSource, DynamicToolProvider, StaticSource, SwitchableProvider, ToolSource};
pub use types::{SourceKind, ToolCallRequest, ToolDefinition, ToolOutput, ToolResult};
