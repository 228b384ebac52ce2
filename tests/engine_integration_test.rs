//! 任务引擎集成测试：脚本化 Mock LLM + 真实注册表 / 执行器 / 协调器

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::core::{AgentError, CoordinatorConfig, TaskStatus};
use hive::llm::{ChatRequest, ChatResponse, MockLlmClient, RetryConfig, RetryingLlmClient};
use hive::memory::{InMemorySessionStore, Role, SessionStore};
use hive::react::{
    EngineConfig, Planner, ProgressEvent, ProgressSink, TaskEngine, DEFAULT_SYSTEM_PROMPT,
};
use hive::tools::{
    EchoTool, LsTool, ResultCache, SlaTracker, Tool, ToolExecutor, ToolOutput, ToolRegistry,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: TaskEngine,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn SessionStore>,
    llm: Arc<MockLlmClient>,
}

async fn harness(llm: MockLlmClient, tools: Vec<Arc<dyn Tool>>, config: EngineConfig) -> Harness {
    let llm = Arc::new(llm);
    let registry = ToolRegistry::new(
        Arc::new(ResultCache::new(Duration::from_secs(60), 64)),
        Arc::new(SlaTracker::default()),
    );
    for tool in tools {
        registry.register_arc(tool).await.unwrap();
    }
    let registry = Arc::new(registry);
    let executor = ToolExecutor::new(Arc::clone(&registry), 5)
        .with_cancel_grace(Duration::from_millis(50));
    let planner = Planner::new(
        RetryingLlmClient::new(llm.clone(), RetryConfig::default().with_max_attempts(1)),
        DEFAULT_SYSTEM_PROMPT,
    );
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    Harness {
        engine: TaskEngine::new(planner, executor, Arc::clone(&store), config),
        registry,
        store,
        llm,
    }
}

fn calls(list: &[(&str, &str, Value)]) -> ChatResponse {
    let calls: Vec<Value> = list
        .iter()
        .map(|(id, name, args)| json!({"id": id, "name": name, "arguments": args}))
        .collect();
    ChatResponse::text(json!({ "tool_calls": calls }).to_string())
}

fn has_tool_messages(request: &ChatRequest) -> bool {
    request.messages.iter().any(|m| m.role == Role::Tool)
}

/// 只读计数工具
struct CountingTool {
    runs: AtomicUsize,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "read-only lookup"
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(ToolOutput::text(format!("value for {args}")))
    }
}

/// 记录并发峰值；n 越小睡得越久，完成顺序与请求顺序相反
struct GaugeTool {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Tool for GaugeTool {
    fn name(&self) -> &str {
        "gauge"
    }

    fn description(&self) -> &str {
        "side-effecting gauge that records peak concurrency"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let n = args.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10 * (6 - n.min(5)))).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::text(format!("gauge {n}")))
    }
}

/// 一直挂起直到被丢弃
struct StuckTool;

#[async_trait]
impl Tool for StuckTool {
    fn name(&self) -> &str {
        "stuck"
    }

    fn description(&self) -> &str {
        "never returns"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ToolOutput::text("late"))
    }
}

#[tokio::test]
async fn test_list_files_scenario() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "n").unwrap();
    std::fs::write(dir.path().join("report.md"), "r").unwrap();

    let h = harness(
        MockLlmClient::new()
            .with_reply(calls(&[("c1", "ls", json!({"path": "."}))]))
            .with_reply(ChatResponse::text("There are two files: notes.txt and report.md")),
        vec![Arc::new(LsTool::new(dir.path()))],
        EngineConfig::default().with_working_dir(dir.path()),
    )
    .await;

    let result = h
        .engine
        .execute(&CancellationToken::new(), "list files in the workspace", None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.answer, "There are two files: notes.txt and report.md");
    assert_eq!(result.steps.len(), 1);
    let step = &result.steps[0];
    assert_eq!(step.results.len(), 1);
    assert!(step.results[0].success);
    assert_eq!(step.results[0].content, "notes.txt\nreport.md");
    assert_eq!(h.llm.call_count(), 2);

    let history = h.store.history(&result.session_id).await;
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_identical_read_only_calls_execute_once() {
    let tool = Arc::new(CountingTool {
        runs: AtomicUsize::new(0),
    });
    let h = harness(
        MockLlmClient::new()
            .with_reply(calls(&[
                ("c1", "lookup", json!({"key": "a", "scope": 1})),
                ("c2", "lookup", json!({"scope": 1, "key": "a"})),
            ]))
            .with_reply(calls(&[("c3", "lookup", json!({"key": "a", "scope": 1}))]))
            .with_reply(ChatResponse::text("done")),
        vec![tool.clone()],
        EngineConfig::default(),
    )
    .await;

    let result = h
        .engine
        .execute(&CancellationToken::new(), "look it up", None)
        .await
        .unwrap();

    assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
    let contents: Vec<&str> = result
        .steps
        .iter()
        .flat_map(|s| s.results.iter())
        .map(|r| r.content.as_str())
        .collect();
    assert_eq!(contents.len(), 3);
    assert!(contents.iter().all(|c| *c == contents[0]));
    assert!(result.steps[1].results[0].cached);
    let stats = h.registry.sla().stats("lookup").await.unwrap();
    assert!(stats.cache_hits >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_calls_respect_cap_and_keep_order() {
    let tool = Arc::new(GaugeTool {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let batch: Vec<(String, Value)> = (1..=5)
        .map(|n| (format!("p{n}"), json!({ "n": n })))
        .collect();
    let list: Vec<(&str, &str, Value)> = batch
        .iter()
        .map(|(id, args)| (id.as_str(), "gauge", args.clone()))
        .collect();

    let h = harness(
        MockLlmClient::new()
            .with_reply(calls(&list))
            .with_reply(ChatResponse::text("measured")),
        vec![tool.clone()],
        EngineConfig::default().with_tool_parallelism(2),
    )
    .await;

    let result = h
        .engine
        .execute(&CancellationToken::new(), "measure", None)
        .await
        .unwrap();

    // 调用数多于上限时应恰好用满上限
    assert_eq!(tool.peak.load(Ordering::SeqCst), 2);
    let ids: Vec<&str> = result.steps[0]
        .results
        .iter()
        .map(|r| r.call_id.as_str())
        .collect();
    assert_eq!(ids, vec!["p1", "p2", "p3", "p4", "p5"]);
    assert_eq!(result.steps[0].results[4].content, "gauge 5");
}

#[tokio::test]
async fn test_cancel_during_tool_keeps_history() {
    let h = harness(
        MockLlmClient::new().with_reply(calls(&[("c1", "stuck", json!({}))])),
        vec![Arc::new(StuckTool), Arc::new(EchoTool)],
        EngineConfig::default(),
    )
    .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let failure = h
        .engine
        .execute(&cancel, "wait forever", None)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, AgentError::Cancelled));
    assert_eq!(failure.result.status, TaskStatus::Cancelled);
    assert_eq!(failure.result.steps.len(), 1);
    let recorded = &failure.result.steps[0].results[0];
    assert!(!recorded.success);
    assert_eq!(recorded.error.as_deref(), Some("Cancelled"));
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delegation_runs_sub_tasks_in_order() {
    let nested_saw_delegation = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&nested_saw_delegation);

    let llm = MockLlmClient::new().with_responder(move |request: &ChatRequest| {
        let goal = request.last_user_message().unwrap_or_default().to_string();
        if goal == "research three topics" {
            if has_tool_messages(request) {
                return Ok(Some(ChatResponse::text("summary of all topics")));
            }
            return Ok(Some(calls(&[(
                "d1",
                "subagent",
                json!({"tasks": ["topic one", "topic two", "topic three"]}),
            )])));
        }
        if request.tools.iter().any(|t| t.name == "subagent") {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(Some(ChatResponse::text(format!("notes on {goal}"))))
    });

    let h = harness(
        llm,
        vec![Arc::new(EchoTool)],
        EngineConfig::default().with_delegation(Some(CoordinatorConfig {
            worker_cap: 2,
            task_timeout: Duration::from_secs(5),
            grace: Duration::from_millis(50),
        })),
    )
    .await;

    let (sink, mut rx) = ProgressSink::channel();
    let result = h
        .engine
        .execute(&CancellationToken::new(), "research three topics", Some(sink))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.answer, "summary of all topics");
    assert!(!nested_saw_delegation.load(Ordering::SeqCst));

    let delegated = &result.steps[0].results[0];
    assert!(delegated.success);
    let one = delegated.content.find("notes on topic one").unwrap();
    let two = delegated.content.find("notes on topic two").unwrap();
    let three = delegated.content.find("notes on topic three").unwrap();
    assert!(one < two && two < three);

    let mut completed = 0;
    while let Ok(envelope) = rx.try_recv() {
        if let ProgressEvent::SubtaskComplete { success, .. } = envelope.event {
            assert!(success);
            completed += 1;
        }
        if envelope.task_id != result.task_id {
            assert_eq!(envelope.parent_task_id.as_deref(), Some(result.task_id.as_str()));
        }
    }
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn test_session_memory_reaches_next_task() {
    let h = harness(
        MockLlmClient::new()
            .with_reply(ChatResponse::text("first answer"))
            .with_responder(|request: &ChatRequest| {
                let system = request
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(Some(ChatResponse::text(if system.contains("remember the milk") {
                    "remembered"
                } else {
                    "forgot"
                })))
            }),
        vec![],
        EngineConfig::default(),
    )
    .await;

    let cancel = CancellationToken::new();
    h.engine
        .execute_in_session(&cancel, "s1", "remember the milk", None)
        .await
        .unwrap();
    let second = h
        .engine
        .execute_in_session(&cancel, "s1", "what did I ask before?", None)
        .await
        .unwrap();
    assert_eq!(second.answer, "remembered");
}
