//! Planner：提示拼装与工具调用解析
//!
//! think 把工具目录注入 system 段后调用 LLM（经重试包装）；
//! parse_llm_output 从回复文本中提取零或多个工具调用，没有调用时即为最终答案。

use std::path::Path;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{ChatRequest, ChatResponse, RetryingLlmClient};
use crate::memory::{Message, Role};
use crate::tools::{tool_call_schema_json, ToolCallRequest, ToolDefinition};

/// 默认 system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Hive, an autonomous task execution agent. \
Work step by step: think about the goal, call tools when you need information or actions, \
observe their results, and stop calling tools once you can answer. \
Independent tool calls may be issued together in one reply; they run concurrently. \
When the task is complete, reply with the final answer in plain text and no JSON.";

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 最终答案
    Response(String),
    /// 本轮需要执行的工具调用
    ToolCalls {
        thought: String,
        calls: Vec<ToolCallRequest>,
    },
}

fn new_call_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &id[..12])
}

/// 提取 JSON 片段及其前面的说明文字
fn extract_json(text: &str) -> Option<(&str, &str)> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some((text[..start].trim(), body.trim()));
    }
    let obj = text.find('{');
    let arr = text.find('[');
    let (start, close) = match (obj, arr) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => return None,
    };
    let end = text.rfind(close)?;
    (end > start).then(|| (text[..start].trim(), &text[start..=end]))
}

/// 裸对象只有两种形状算工具调用：带 `tool` 键，或同时带 `name` 与 `arguments`
fn is_call_shaped(item: &Value) -> bool {
    item.get("tool").is_some_and(Value::is_string)
        || (item.get("name").is_some_and(Value::is_string) && item.get("arguments").is_some())
}

fn call_from_value(item: &Value) -> Option<ToolCallRequest> {
    let name = item
        .get("name")
        .or_else(|| item.get("tool"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?;
    let arguments = match item.get("arguments").or_else(|| item.get("args")) {
        // OpenAI 风格：arguments 为 JSON 字符串
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| json!({ "input": raw }))
        }
        Some(v) => v.clone(),
        None => json!({}),
    };
    let id = item
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(new_call_id);
    Some(ToolCallRequest::new(id, name, arguments))
}

/// 解析 LLM 输出
///
/// 支持 `{"tool_calls": [...]}`、调用数组、单个 `{"tool", "args"}` 或 `{"name", "arguments"}`；
/// 只有 `name` 的数据对象与其余文本一样视为最终答案。形似工具调用但 JSON 非法时返回 JsonParseError。
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();
    let Some((thought, json_str)) = extract_json(trimmed) else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let value: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e)
            if json_str.contains("\"tool")
                || (json_str.contains("\"name\"") && json_str.contains("\"arguments\"")) =>
        {
            return Err(AgentError::JsonParseError(format!("{e}: {json_str}")));
        }
        Err(_) => return Ok(PlannerOutput::Response(trimmed.to_string())),
    };

    let items: Vec<&Value> = match &value {
        Value::Object(map) => match map.get("tool_calls") {
            Some(Value::Array(list)) => list.iter().collect(),
            Some(_) => {
                return Err(AgentError::JsonParseError(
                    "tool_calls must be an array".to_string(),
                ))
            }
            None if is_call_shaped(&value) => vec![&value],
            None => return Ok(PlannerOutput::Response(trimmed.to_string())),
        },
        Value::Array(list) if !list.is_empty() && list.iter().all(is_call_shaped) => {
            list.iter().collect()
        }
        _ => return Ok(PlannerOutput::Response(trimmed.to_string())),
    };

    let calls: Vec<ToolCallRequest> = items.into_iter().filter_map(call_from_value).collect();
    if calls.is_empty() {
        if value.get("tool_calls").is_some() {
            // 显式的空列表：没有调用，前置文字即答案
            return Ok(PlannerOutput::Response(thought.to_string()));
        }
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    }
    Ok(PlannerOutput::ToolCalls {
        thought: thought.to_string(),
        calls,
    })
}

/// 从模型回复得到本轮决策：优先使用原生工具调用，否则解析文本
pub fn decide(response: &ChatResponse) -> Result<PlannerOutput, AgentError> {
    if !response.tool_calls.is_empty() {
        return Ok(PlannerOutput::ToolCalls {
            thought: response.content.trim().to_string(),
            calls: response.tool_calls.clone(),
        });
    }
    parse_llm_output(&response.content)
}

/// 工具目录段落（注入 system）
fn catalog_prompt(tools: &[ToolDefinition]) -> String {
    let listing: Vec<Value> = tools
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "description": d.description,
                "parameters": d.parameters,
            })
        })
        .collect();
    format!(
        "## Available tools\n{}\n\n## Tool call format\nTo call tools reply with JSON matching this schema:\n{}",
        serde_json::to_string_pretty(&listing).unwrap_or_else(|_| "[]".to_string()),
        tool_call_schema_json()
    )
}

/// Planner：持有带重试的 LLM 与基础 system prompt
pub struct Planner {
    llm: RetryingLlmClient,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: RetryingLlmClient, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 任务级 system prompt：基础提示 + 工作目录 + 目标 + 会话记忆
    pub fn task_system_prompt(&self, working_dir: &Path, goal: &str, memory: &[Message]) -> String {
        let mut prompt = format!(
            "{}\n\nWorking directory: {}\nCurrent goal: {}",
            self.system_prompt,
            working_dir.display(),
            goal
        );
        let earlier: Vec<String> = memory
            .iter()
            .filter(|m| m.role == Role::User)
            .rev()
            .take(5)
            .map(|m| format!("- {}", truncate(&m.content, 200)))
            .collect();
        if !earlier.is_empty() {
            prompt.push_str("\n\nEarlier requests in this session (most recent first):\n");
            prompt.push_str(&earlier.join("\n"));
        }
        prompt
    }

    /// 一次思考：工具目录 + 消息窗口
    pub async fn think(
        &self,
        cancel: &CancellationToken,
        messages: Vec<Message>,
        tools: &[ToolDefinition],
        session_id: &str,
    ) -> Result<ChatResponse, AgentError> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        if !tools.is_empty() {
            full.push(Message::system(catalog_prompt(tools)));
        }
        full.extend(messages);
        let request = ChatRequest::new(full).with_tools(tools.to_vec());
        Ok(self.llm.call(cancel, &request, session_id).await?)
    }

    /// 预分析：不带工具，让模型先拆解目标
    pub async fn pre_analyze(
        &self,
        cancel: &CancellationToken,
        goal: &str,
        session_id: &str,
    ) -> Result<ChatResponse, AgentError> {
        let request = ChatRequest::new(vec![
            Message::system(
                "Analyse the task below before it is executed. \
                 List the sub-problems, the information needed, and a short plan. Do not call tools.",
            ),
            Message::user(goal),
        ]);
        Ok(self.llm.call(cancel, &request, session_id).await?)
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
