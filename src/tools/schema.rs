//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法工具调用」的 JSON 结构注入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 一次回复中的工具调用列表（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallsFormat {
    /// 本轮要执行的全部工具调用；互相独立的调用会并发执行
    tool_calls: Vec<ToolCallFormat>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 调用 id，在同一回复内唯一，如 call_1
    id: String,
    /// 工具名，如 ls、cat、echo、subagent
    name: String,
    /// 工具参数，依工具不同而不同
    arguments: Value,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallsFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("tool_calls"));
        assert!(schema.contains("arguments"));
    }
}
