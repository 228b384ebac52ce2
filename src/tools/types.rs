//! 工具调用相关的公共类型：调用请求、工具定义、执行输出与结果

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 模型发出的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 工具来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Static,
    Dynamic,
    Remote,
}

/// 提供给模型的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: SourceKind,
}

/// 工具执行的原始输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for ToolOutput {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

/// 一次调用的结果：成功 / 失败、内容、错误文本、降级元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// 结果来自缓存（含 single-flight 共享）
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCallRequest, output: ToolOutput) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            content: output.content,
            data: output.data,
            error: None,
            metadata: Map::new(),
            cached: false,
            duration_ms: 0,
        }
    }

    pub fn failure(call: &ToolCallRequest, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            content: String::new(),
            data: None,
            error: Some(error.into()),
            metadata: Map::new(),
            cached: false,
            duration_ms: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 写回对话历史的文本
    pub fn observation(&self) -> String {
        if self.success {
            self.content.clone()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("tool execution failed")
            )
        }
    }
}
