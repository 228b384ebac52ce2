//! 任务执行引擎（think / act / observe 主循环）
//!
//! Initializing → (Thinking → Dispatching → Observing)* → Finalizing | Failed | Cancelled。
//! 每个任务独占一个 TaskContext 和对话历史；同一轮的工具结果按请求顺序写回，
//! 委派调用（subagent）交给子任务协调器，由嵌套引擎执行。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    run_serial, AgentError, CoordinatorConfig, RecoveryAction, RecoveryEngine, SubTaskCoordinator,
    SubTaskResult, SubTaskRunner, TaskContext, TaskFailure, TaskKind, TaskPhase, TaskResult,
    TaskScheduler, TaskStep,
};
use crate::llm::{ChatResponse, LlmError};
use crate::memory::{prompt_window, ConversationMemory, Message, SessionStore};
use crate::react::dispatch::{
    delegation_result, delegation_tool_definition, dispatch_ordinary, DispatchPlan,
    DELEGATION_TOOL,
};
use crate::react::events::{send_event, ProgressEvent, ProgressSink};
use crate::react::planner::{decide, Planner, PlannerOutput};
use crate::tools::{ToolCallRequest, ToolDefinition, ToolExecutor, ToolResult};

/// 上下文超长时窗口最多缩到这么小
const MIN_PROMPT_WINDOW: usize = 4;

/// 引擎参数；引擎构建后不再变化
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: usize,
    /// 同一轮普通工具调用的并发上限
    pub tool_parallelism: usize,
    pub pre_analysis: bool,
    /// 每次思考带入的非 system 消息条数
    pub prompt_window: usize,
    pub working_dir: PathBuf,
    /// None：不提供委派工具（嵌套引擎即如此）
    pub delegation: Option<CoordinatorConfig>,
    pub subtask_max_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tool_parallelism: 4,
            pre_analysis: false,
            prompt_window: 40,
            working_dir: PathBuf::from("."),
            delegation: Some(CoordinatorConfig::default()),
            subtask_max_iterations: 15,
        }
    }
}

impl EngineConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.engine.max_iterations,
            tool_parallelism: cfg.engine.tool_parallelism,
            pre_analysis: cfg.engine.pre_analysis,
            prompt_window: cfg.engine.prompt_window,
            working_dir: cfg
                .tools
                .filesystem_root
                .clone()
                .unwrap_or_else(|| cfg.app.workspace()),
            delegation: Some(CoordinatorConfig {
                worker_cap: cfg.subtask.worker_cap,
                task_timeout: Duration::from_secs(cfg.subtask.task_timeout_secs),
                grace: cfg.engine.cancel_grace(),
            }),
            subtask_max_iterations: cfg.subtask.max_iterations,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_delegation(mut self, delegation: Option<CoordinatorConfig>) -> Self {
        self.delegation = delegation;
        self
    }

    pub fn with_pre_analysis(mut self, enabled: bool) -> Self {
        self.pre_analysis = enabled;
        self
    }

    pub fn with_tool_parallelism(mut self, n: usize) -> Self {
        self.tool_parallelism = n;
        self
    }

    pub fn with_prompt_window(mut self, n: usize) -> Self {
        self.prompt_window = n;
        self
    }
}

/// 引擎共享的只读依赖（父引擎与嵌套引擎共用）
struct EngineDeps {
    planner: Planner,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    store: Arc<dyn SessionStore>,
}

/// 任务执行引擎；clone 廉价，可在多个任务间共享
#[derive(Clone)]
pub struct TaskEngine {
    deps: Arc<EngineDeps>,
    config: Arc<EngineConfig>,
}

impl TaskEngine {
    pub fn new(
        planner: Planner,
        executor: ToolExecutor,
        store: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            deps: Arc::new(EngineDeps {
                planner,
                executor,
                recovery: RecoveryEngine::new(),
                store,
            }),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.deps.executor
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.deps.store
    }

    pub fn delegation_enabled(&self) -> bool {
        self.config.delegation.is_some()
    }

    /// 子任务用的嵌套引擎：共享依赖，不提供委派工具，使用子任务迭代上限
    pub fn nested(&self) -> TaskEngine {
        let mut config = (*self.config).clone();
        config.delegation = None;
        config.pre_analysis = false;
        config.max_iterations = config.subtask_max_iterations;
        Self {
            deps: Arc::clone(&self.deps),
            config: Arc::new(config),
        }
    }

    /// 在新会话中执行目标
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        goal: &str,
        sink: Option<ProgressSink>,
    ) -> Result<TaskResult, TaskFailure> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.execute_in_session(cancel, &session_id, goal, sink).await
    }

    /// 在指定会话中执行目标；会话里较早的请求会写进 system prompt
    pub async fn execute_in_session(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        goal: &str,
        sink: Option<ProgressSink>,
    ) -> Result<TaskResult, TaskFailure> {
        let ctx = TaskContext::new(goal, session_id, self.config.working_dir.clone());
        let sink = sink.map(|s| s.for_task(&ctx.id, session_id));
        tracing::info!(
            task_id = %ctx.id,
            session_id = %session_id,
            delegation = self.delegation_enabled(),
            "task start"
        );

        let mut run = TaskRun {
            engine: self,
            ctx,
            conversation: ConversationMemory::new(),
            sink,
            window: self.config.prompt_window.max(MIN_PROMPT_WINDOW),
            scheduler: TaskScheduler::new(TaskKind::ToolExecution, self.config.tool_parallelism),
        };

        match run.drive(cancel).await {
            Ok(()) => {
                let result = run.ctx.to_result(None);
                tracing::info!(
                    task_id = %result.task_id,
                    iterations = result.iterations,
                    tokens = result.tokens.total,
                    duration_ms = result.duration.as_millis() as u64,
                    "task succeeded"
                );
                Ok(result)
            }
            Err(e) => Err(run.fail(e)),
        }
    }
}

#[async_trait]
impl SubTaskRunner for TaskEngine {
    async fn run(
        &self,
        cancel: CancellationToken,
        goal: String,
        sink: Option<ProgressSink>,
    ) -> Result<TaskResult, TaskFailure> {
        self.execute(&cancel, &goal, sink).await
    }
}

/// 单次任务执行的状态
struct TaskRun<'a> {
    engine: &'a TaskEngine,
    ctx: TaskContext,
    conversation: ConversationMemory,
    sink: Option<ProgressSink>,
    window: usize,
    scheduler: TaskScheduler,
}

impl TaskRun<'_> {
    fn emit(&self, event: ProgressEvent) {
        send_event(self.sink.as_ref(), event);
    }

    fn enter(&mut self, phase: TaskPhase, message: impl Into<String>) {
        self.ctx.transition(phase);
        self.emit(ProgressEvent::Status {
            phase,
            message: message.into(),
        });
    }

    /// 追加到本任务对话，并同步写入会话存储
    async fn record(&mut self, messages: Vec<Message>) {
        self.conversation.extend(messages.iter().cloned());
        self.engine
            .deps
            .store
            .append(&self.ctx.session_id, messages)
            .await;
    }

    fn fail(mut self, error: AgentError) -> TaskFailure {
        let phase = match error {
            AgentError::Cancelled => TaskPhase::Cancelled,
            _ => TaskPhase::Failed,
        };
        self.ctx.transition(phase);
        self.emit(ProgressEvent::Error {
            text: error.to_string(),
        });
        tracing::warn!(
            task_id = %self.ctx.id,
            iterations = self.ctx.iterations,
            error = %error,
            "task ended without answer"
        );
        TaskFailure {
            result: self.ctx.to_result(Some(error.to_string())),
            error,
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let engine = self.engine;
        let config = &engine.config;

        // 会话历史只在任务开始时读取一次；任务期间本地对话与存储同步追加
        let history = engine.deps.store.history(&self.ctx.session_id).await;
        let system = engine
            .deps
            .planner
            .task_system_prompt(&self.ctx.working_dir, &self.ctx.goal, &history);
        self.conversation.push(Message::system(system));

        let task_text = self.task_text(cancel).await;
        self.record(vec![Message::user(task_text)]).await;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if self.ctx.iterations >= config.max_iterations {
                return Err(AgentError::IterationCeilingExceeded(self.ctx.iterations));
            }

            self.enter(
                TaskPhase::Thinking,
                format!("iteration {}", self.ctx.iterations + 1),
            );
            let tools = self.tool_catalog().await;
            let response = self.think(cancel, &tools).await?;
            self.count_tokens(&response);

            let (thought, calls) = match decide(&response) {
                Ok(PlannerOutput::Response(text)) => {
                    self.finalize(text).await;
                    return Ok(());
                }
                Ok(PlannerOutput::ToolCalls { thought, calls }) if calls.is_empty() => {
                    self.finalize(thought).await;
                    return Ok(());
                }
                Ok(PlannerOutput::ToolCalls { thought, calls }) => (thought, calls),
                Err(e) => match engine.deps.recovery.handle(&e) {
                    RecoveryAction::RetryWithPrompt(hint) => {
                        tracing::warn!(task_id = %self.ctx.id, error = %e, "unparseable tool call, asking model to retry");
                        self.ctx.iterations += 1;
                        self.record(vec![
                            Message::assistant(response.content.clone()),
                            Message::user(hint),
                        ])
                        .await;
                        continue;
                    }
                    _ => return Err(e),
                },
            };

            if !thought.is_empty() {
                self.emit(ProgressEvent::Reasoning {
                    text: thought.clone(),
                });
            }
            let started = Instant::now();
            let started_at = chrono::Utc::now().timestamp_millis();
            self.record(vec![Message::assistant(response.content.clone())
                .with_metadata("tool_calls", json!(calls))])
            .await;

            self.enter(
                TaskPhase::Dispatching,
                format!("{} tool call(s)", calls.len()),
            );
            let results = self.dispatch(cancel, &calls).await;

            self.enter(TaskPhase::Observing, "recording tool results");
            let observations = calls
                .iter()
                .zip(&results)
                .map(|(call, result)| Message::tool(&call.id, &call.name, result.observation()))
                .collect();
            self.record(observations).await;

            self.ctx.steps.push(TaskStep {
                index: self.ctx.steps.len(),
                thought,
                calls,
                results,
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            self.ctx.iterations += 1;
            self.emit(ProgressEvent::StepUpdate {
                step: self.ctx.iterations,
                max_steps: config.max_iterations,
            });
        }
    }

    /// 用户可见的任务文本；开启预分析时附上分析结果，预分析失败不影响任务
    async fn task_text(&mut self, cancel: &CancellationToken) -> String {
        let goal = self.ctx.goal.clone();
        if !self.engine.config.pre_analysis {
            return goal;
        }
        match self
            .engine
            .deps
            .planner
            .pre_analyze(cancel, &goal, &self.ctx.session_id)
            .await
        {
            Ok(response) => {
                self.count_tokens(&response);
                let analysis = response.content.trim();
                if analysis.is_empty() {
                    goal
                } else {
                    format!("{goal}\n\n[Pre-analysis]\n{analysis}")
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %self.ctx.id, error = %e, "pre-analysis failed, continuing");
                self.emit(ProgressEvent::Status {
                    phase: TaskPhase::Initializing,
                    message: format!("pre-analysis skipped: {e}"),
                });
                goal
            }
        }
    }

    async fn tool_catalog(&self) -> Vec<ToolDefinition> {
        let mut tools = self.engine.deps.executor.definitions().await;
        if self.engine.delegation_enabled() {
            tools.push(delegation_tool_definition());
        }
        tools
    }

    /// 调用模型；上下文超长时缩小窗口重试
    async fn think(
        &mut self,
        cancel: &CancellationToken,
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, AgentError> {
        let deps = &self.engine.deps;
        loop {
            let messages = prompt_window(self.conversation.messages(), self.window);
            let err = match deps
                .planner
                .think(cancel, messages, tools, &self.ctx.session_id)
                .await
            {
                Ok(response) => return Ok(response),
                Err(AgentError::Transport(LlmError::Cancelled)) => return Err(AgentError::Cancelled),
                Err(_) if cancel.is_cancelled() => return Err(AgentError::Cancelled),
                Err(e) => e,
            };
            match deps.recovery.handle(&err) {
                RecoveryAction::SummarizeAndPrune if self.window > MIN_PROMPT_WINDOW => {
                    let next = (self.window / 2).max(MIN_PROMPT_WINDOW);
                    tracing::warn!(task_id = %self.ctx.id, from = self.window, to = next, "context window exceeded, shrinking prompt");
                    self.window = next;
                }
                _ => return Err(err),
            }
        }
    }

    fn count_tokens(&mut self, response: &ChatResponse) {
        self.ctx.tokens.add_usage(&response.usage);
        self.emit(ProgressEvent::TokenUsage {
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            cumulative_total: self.ctx.tokens.total,
        });
    }

    async fn finalize(&mut self, answer: String) {
        self.enter(TaskPhase::Finalizing, "final answer");
        self.ctx.answer = answer.clone();
        self.record(vec![Message::assistant(answer.clone())]).await;
        self.emit(ProgressEvent::FinalAnswer { text: answer });
    }

    /// 分派一轮调用；返回与 calls 一一对应的结果，缺失的结果以显式失败补齐
    async fn dispatch(
        &mut self,
        cancel: &CancellationToken,
        calls: &[ToolCallRequest],
    ) -> Vec<ToolResult> {
        let plan = DispatchPlan::partition(calls, self.engine.delegation_enabled());
        let goals = plan.delegated_goals();
        let DispatchPlan {
            ordinary,
            delegations,
            rejected,
        } = plan;

        let mut slots: Vec<Option<ToolResult>> = (0..calls.len()).map(|_| None).collect();
        for (index, result) in rejected {
            slots[index] = Some(result);
        }

        let started = Instant::now();
        let ordinary_calls: Vec<ToolCallRequest> =
            ordinary.iter().map(|(_, call)| call.clone()).collect();
        let (ordinary_results, delegated) = tokio::join!(
            dispatch_ordinary(
                &self.engine.deps.executor,
                &self.scheduler,
                &ordinary_calls,
                cancel,
                self.sink.as_ref(),
            ),
            self.run_delegations(cancel, &goals),
        );

        for ((index, _), result) in ordinary.into_iter().zip(ordinary_results) {
            slots[index] = Some(result);
        }

        match delegated {
            Ok(sub_results) => {
                for result in &sub_results {
                    self.ctx.tokens.merge(&result.tokens);
                }
                let mut offset = 0;
                for (index, call, call_goals) in delegations {
                    let end = (offset + call_goals.len()).min(sub_results.len());
                    let slice = &sub_results[offset.min(end)..end];
                    offset = end;
                    slots[index] = Some(delegation_result(&call, &call_goals, slice, started));
                }
            }
            Err(e) => {
                for (index, call, _) in delegations {
                    slots[index] = Some(ToolResult::failure(&call, e.to_string()));
                }
            }
        }

        slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| ToolResult::failure(call, "no result recorded for call"))
            })
            .collect()
    }

    /// 执行全部委派目标；协调器不可用时退化为逐个执行
    async fn run_delegations(
        &self,
        cancel: &CancellationToken,
        goals: &[String],
    ) -> Result<Vec<SubTaskResult>, AgentError> {
        if goals.is_empty() {
            return Ok(Vec::new());
        }
        let Some(config) = self.engine.config.delegation.clone() else {
            return Err(AgentError::ToolNotFound(DELEGATION_TOOL.to_string()));
        };
        let runner: Arc<dyn SubTaskRunner> = Arc::new(self.engine.nested());
        let sink = self.sink.as_ref();

        let structural = match SubTaskCoordinator::new(Arc::clone(&runner), config.clone()) {
            Ok(coordinator) => match coordinator.run_batch(cancel, goals, sink).await {
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => e,
                ok => return ok,
            },
            Err(e) => e,
        };

        tracing::warn!(task_id = %self.ctx.id, error = %structural, "coordinator unavailable, running sub-tasks serially");
        let mut serial = config;
        if serial.task_timeout.is_zero() {
            serial.task_timeout = CoordinatorConfig::default().task_timeout;
        }
        Ok(run_serial(runner, cancel, goals, &serial, sink).await)
    }
}
