//! 子任务协调器
//!
//! 一批子目标并发执行，同时运行数不超过 worker_cap（1..=10）；每个子任务有独立超时、
//! 独立的取消子令牌与 panic 隔离。结果按提交顺序返回，与完成顺序无关；任何一个失败都不影响其它。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::context::{TaskResult, TokenCounters};
use crate::core::task_scheduler::{TaskKind, TaskScheduler};
use crate::core::{AgentError, TaskFailure};
use crate::react::events::{send_event, ProgressEvent, ProgressSink};
use crate::tools::executor::panic_message;

pub const MAX_WORKER_CAP: usize = 10;
pub const DEFAULT_WORKER_CAP: usize = 3;

/// 子任务失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubTaskErrorCategory {
    ContextLimit,
    PanicRecovered,
    Timeout,
    General,
}

impl SubTaskErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SubTaskErrorCategory::ContextLimit => "context-limit",
            SubTaskErrorCategory::PanicRecovered => "panic-recovered",
            SubTaskErrorCategory::Timeout => "timeout",
            SubTaskErrorCategory::General => "general",
        }
    }

    fn of(error: &AgentError) -> Self {
        match error {
            e if e.is_context_limit() => SubTaskErrorCategory::ContextLimit,
            AgentError::SubTaskPanic(_) | AgentError::ToolPanic(_) => {
                SubTaskErrorCategory::PanicRecovered
            }
            AgentError::SubTaskTimeout(_) => SubTaskErrorCategory::Timeout,
            _ => SubTaskErrorCategory::General,
        }
    }
}

/// 单个子任务的结果
#[derive(Debug, Clone, Serialize)]
pub struct SubTaskResult {
    pub index: usize,
    pub goal: String,
    pub success: bool,
    /// 最终答案；失败时为可用的部分输出
    pub result: String,
    /// 子任务是否走到了自己的终态（超时 / panic 时为 false）
    pub completed: bool,
    pub session_id: String,
    pub tokens: TokenCounters,
    pub duration: Duration,
    pub error: Option<String>,
    pub category: Option<SubTaskErrorCategory>,
}

impl SubTaskResult {
    fn failed(
        index: usize,
        goal: &str,
        category: SubTaskErrorCategory,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            goal: goal.to_string(),
            success: false,
            result: String::new(),
            completed: false,
            session_id: String::new(),
            tokens: TokenCounters::default(),
            duration,
            error: Some(format!("[{}] {}", category.as_str(), message.into())),
            category: Some(category),
        }
    }

    fn from_outcome(
        index: usize,
        goal: &str,
        outcome: Result<TaskResult, TaskFailure>,
        duration: Duration,
    ) -> Self {
        match outcome {
            Ok(task) => Self {
                index,
                goal: goal.to_string(),
                success: true,
                result: task.answer,
                completed: true,
                session_id: task.session_id,
                tokens: task.tokens,
                duration,
                error: None,
                category: None,
            },
            Err(failure) => {
                let category = SubTaskErrorCategory::of(&failure.error);
                Self {
                    index,
                    goal: goal.to_string(),
                    success: false,
                    result: failure.result.partial_output().unwrap_or_default(),
                    completed: true,
                    session_id: failure.result.session_id.clone(),
                    tokens: failure.result.tokens,
                    duration,
                    error: Some(format!("[{}] {}", category.as_str(), failure.error)),
                    category: Some(category),
                }
            }
        }
    }
}

/// 子任务执行者：由任务引擎实现（嵌套实例，不含委派工具）
#[async_trait]
pub trait SubTaskRunner: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
        goal: String,
        sink: Option<ProgressSink>,
    ) -> Result<TaskResult, TaskFailure>;
}

/// 协调器参数
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker_cap: usize,
    pub task_timeout: Duration,
    /// 超时后等待子任务交还部分结果的时间
    pub grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_cap: DEFAULT_WORKER_CAP,
            task_timeout: Duration::from_secs(120),
            grace: Duration::from_secs(2),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.worker_cap == 0 || self.worker_cap > MAX_WORKER_CAP {
            return Err(AgentError::Coordinator(format!(
                "worker_cap must be within 1..={MAX_WORKER_CAP}, got {}",
                self.worker_cap
            )));
        }
        if self.task_timeout.is_zero() {
            return Err(AgentError::Coordinator(
                "task_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// 子任务协调器
pub struct SubTaskCoordinator {
    runner: Arc<dyn SubTaskRunner>,
    config: CoordinatorConfig,
}

impl SubTaskCoordinator {
    /// 参数非法时返回结构性错误
    pub fn new(runner: Arc<dyn SubTaskRunner>, config: CoordinatorConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self { runner, config })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// 并发执行一批目标，结果与 goals 一一对应
    ///
    /// 仅当取消发生在任何子任务开始之前时返回 Err(Cancelled)，不产生部分结果。
    pub async fn run_batch(
        &self,
        cancel: &CancellationToken,
        goals: &[String],
        sink: Option<&ProgressSink>,
    ) -> Result<Vec<SubTaskResult>, AgentError> {
        if goals.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let total = goals.len();
        let scheduler = TaskScheduler::new(TaskKind::SubTask, self.config.worker_cap);
        let started = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();

        tracing::info!(total, worker_cap = self.config.worker_cap, "sub-task batch start");

        for (index, goal) in goals.iter().enumerate() {
            let runner = Arc::clone(&self.runner);
            let scheduler = scheduler.clone();
            let started = Arc::clone(&started);
            let cancel = cancel.clone();
            let sink = sink.cloned();
            let goal = goal.clone();
            let config = self.config.clone();

            set.spawn(async move {
                let begin = Instant::now();
                let _permit = match scheduler.acquire_or_cancel(&cancel).await {
                    Ok(p) => p,
                    Err(e) => {
                        return SubTaskResult::failed(
                            index,
                            &goal,
                            SubTaskErrorCategory::General,
                            e.to_string(),
                            begin.elapsed(),
                        )
                    }
                };
                started.fetch_add(1, Ordering::SeqCst);
                send_event(
                    sink.as_ref(),
                    ProgressEvent::SubtaskProgress {
                        index,
                        total,
                        message: format!("started: {goal}"),
                    },
                );
                let result = run_one(runner, &cancel, index, &goal, &config, sink.clone()).await;
                send_event(
                    sink.as_ref(),
                    ProgressEvent::SubtaskComplete {
                        index,
                        success: result.success,
                        category: result.category.map(|c| c.as_str().to_string()),
                        duration_ms: result.duration.as_millis() as u64,
                    },
                );
                result
            });
        }

        let mut slots: Vec<Option<SubTaskResult>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    let index = result.index;
                    slots[index] = Some(result);
                }
                Err(e) => tracing::error!(error = %e, "sub-task worker aborted"),
            }
        }

        if started.load(Ordering::SeqCst) == 0 && cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let results: Vec<SubTaskResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    SubTaskResult::failed(
                        index,
                        &goals[index],
                        SubTaskErrorCategory::General,
                        "sub-task worker lost",
                        Duration::ZERO,
                    )
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(total, succeeded, "sub-task batch done");
        Ok(results)
    }
}

/// 执行单个子任务：超时、panic、失败都归类为结果
async fn run_one(
    runner: Arc<dyn SubTaskRunner>,
    cancel: &CancellationToken,
    index: usize,
    goal: &str,
    config: &CoordinatorConfig,
    sink: Option<ProgressSink>,
) -> SubTaskResult {
    let begin = Instant::now();
    let child = cancel.child_token();
    let fut = AssertUnwindSafe(runner.run(child.clone(), goal.to_string(), sink)).catch_unwind();
    tokio::pin!(fut);

    match tokio::time::timeout(config.task_timeout, &mut fut).await {
        Ok(Ok(outcome)) => SubTaskResult::from_outcome(index, goal, outcome, begin.elapsed()),
        Ok(Err(panic)) => {
            let msg = panic_message(panic.as_ref());
            tracing::error!(index, panic = %msg, "sub-task panicked");
            SubTaskResult::failed(
                index,
                goal,
                SubTaskErrorCategory::PanicRecovered,
                AgentError::SubTaskPanic(msg).to_string(),
                begin.elapsed(),
            )
        }
        Err(_) => {
            tracing::warn!(index, timeout_secs = config.task_timeout.as_secs_f64(), "sub-task timed out");
            child.cancel();
            let partial = match tokio::time::timeout(config.grace, &mut fut).await {
                Ok(Ok(Ok(task))) => Some(task),
                Ok(Ok(Err(failure))) => Some(failure.result),
                _ => None,
            };
            let message = AgentError::SubTaskTimeout(format!(
                "exceeded {:.1}s",
                config.task_timeout.as_secs_f64()
            ));
            let mut result = SubTaskResult::failed(
                index,
                goal,
                SubTaskErrorCategory::Timeout,
                message.to_string(),
                begin.elapsed(),
            );
            if let Some(task) = partial {
                result.result = task.partial_output().unwrap_or_default();
                result.session_id = task.session_id;
                result.tokens = task.tokens;
            }
            result
        }
    }
}

/// 退路：逐个执行（协调器参数非法时使用）
pub async fn run_serial(
    runner: Arc<dyn SubTaskRunner>,
    cancel: &CancellationToken,
    goals: &[String],
    config: &CoordinatorConfig,
    sink: Option<&ProgressSink>,
) -> Vec<SubTaskResult> {
    let mut results = Vec::with_capacity(goals.len());
    for (index, goal) in goals.iter().enumerate() {
        if cancel.is_cancelled() {
            results.push(SubTaskResult::failed(
                index,
                goal,
                SubTaskErrorCategory::General,
                AgentError::Cancelled.to_string(),
                Duration::ZERO,
            ));
            continue;
        }
        let result = run_one(Arc::clone(&runner), cancel, index, goal, config, sink.cloned()).await;
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::TaskContext;
    use crate::core::TaskPhase;
    use std::path::PathBuf;

    /// 目标格式 "<ms>" / "panic" / "fail" / "ctx" / "hang"
    struct ScriptedRunner {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn finished(goal: &str, answer: &str) -> TaskResult {
        let mut ctx = TaskContext::new(goal, format!("s-{goal}"), PathBuf::from("."));
        ctx.transition(TaskPhase::Thinking);
        ctx.transition(TaskPhase::Finalizing);
        ctx.answer = answer.to_string();
        ctx.to_result(None)
    }

    #[async_trait]
    impl SubTaskRunner for ScriptedRunner {
        async fn run(
            &self,
            cancel: CancellationToken,
            goal: String,
            _sink: Option<ProgressSink>,
        ) -> Result<TaskResult, TaskFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let out = match goal.as_str() {
                "panic" => {
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    panic!("sub-task exploded");
                }
                "fail" => Err(TaskFailure {
                    error: AgentError::ToolExecutionFailed("boom".into()),
                    result: finished(&goal, ""),
                }),
                "ctx" => Err(TaskFailure {
                    error: AgentError::Transport(crate::llm::LlmError::ContextWindowExceeded(
                        "too long".into(),
                    )),
                    result: finished(&goal, ""),
                }),
                "hang" => {
                    cancel.cancelled().await;
                    Err(TaskFailure {
                        error: AgentError::Cancelled,
                        result: finished(&goal, "partial work"),
                    })
                }
                ms => {
                    let ms: u64 = ms.parse().unwrap_or(1);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(finished(&goal, &format!("done {ms}")))
                }
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    fn config(cap: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            worker_cap: cap,
            task_timeout: Duration::from_secs(5),
            grace: Duration::from_millis(100),
        }
    }

    fn goals(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_follow_submission_order() {
        let runner = ScriptedRunner::new();
        let coord = SubTaskCoordinator::new(runner, config(3)).unwrap();
        let results = coord
            .run_batch(&CancellationToken::new(), &goals(&["120", "60", "5"]), None)
            .await
            .unwrap();
        let answers: Vec<&str> = results.iter().map(|r| r.result.as_str()).collect();
        assert_eq!(answers, vec!["done 120", "done 60", "done 5"]);
        assert!(results.iter().all(|r| r.success && r.completed));
        assert_eq!(
            results.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_cap_is_respected() {
        let runner = ScriptedRunner::new();
        let coord = SubTaskCoordinator::new(runner.clone(), config(2)).unwrap();
        let results = coord
            .run_batch(
                &CancellationToken::new(),
                &goals(&["40", "40", "40", "40", "40"]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        // 目标数多于上限时应恰好用满上限
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let runner = ScriptedRunner::new();
        let coord = SubTaskCoordinator::new(runner, config(3)).unwrap();
        let results = coord
            .run_batch(&CancellationToken::new(), &goals(&["5", "panic", "5"]), None)
            .await
            .unwrap();
        assert!(results[0].success);
        assert!(results[2].success);
        assert!(!results[1].success);
        assert_eq!(
            results[1].category,
            Some(SubTaskErrorCategory::PanicRecovered)
        );
        assert!(results[1]
            .error
            .as_deref()
            .unwrap()
            .starts_with("[panic-recovered]"));
    }

    #[tokio::test]
    async fn test_failure_categories() {
        let runner = ScriptedRunner::new();
        let coord = SubTaskCoordinator::new(runner, config(2)).unwrap();
        let results = coord
            .run_batch(&CancellationToken::new(), &goals(&["fail", "ctx"]), None)
            .await
            .unwrap();
        assert_eq!(results[0].category, Some(SubTaskErrorCategory::General));
        assert_eq!(
            results[1].category,
            Some(SubTaskErrorCategory::ContextLimit)
        );
        assert!(results.iter().all(|r| r.completed));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let runner = ScriptedRunner::new();
        let coord = SubTaskCoordinator::new(
            runner,
            CoordinatorConfig {
                task_timeout: Duration::from_millis(50),
                ..config(2)
            },
        )
        .unwrap();
        let results = coord
            .run_batch(&CancellationToken::new(), &goals(&["hang", "5"]), None)
            .await
            .unwrap();
        assert_eq!(results[0].category, Some(SubTaskErrorCategory::Timeout));
        assert!(!results[0].completed);
        assert_eq!(results[0].result, "partial work");
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn test_cancel_before_start_fails_whole_batch() {
        let runner = ScriptedRunner::new();
        let coord = SubTaskCoordinator::new(runner.clone(), config(2)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = coord.run_batch(&cancel, &goals(&["5", "5"]), None).await;
        assert!(matches!(res, Err(AgentError::Cancelled)));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_worker_cap_is_structural_error() {
        let runner = ScriptedRunner::new();
        assert!(matches!(
            SubTaskCoordinator::new(runner.clone(), config(0)),
            Err(AgentError::Coordinator(_))
        ));
        assert!(matches!(
            SubTaskCoordinator::new(runner, config(MAX_WORKER_CAP + 1)),
            Err(AgentError::Coordinator(_))
        ));
    }

    #[tokio::test]
    async fn test_serial_fallback_preserves_order() {
        let runner = ScriptedRunner::new();
        let results = run_serial(
            runner.clone(),
            &CancellationToken::new(),
            &goals(&["20", "1"]),
            &config(1),
            None,
        )
        .await;
        assert_eq!(results[0].result, "done 20");
        assert_eq!(results[1].result, "done 1");
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let coord = SubTaskCoordinator::new(ScriptedRunner::new(), config(1)).unwrap();
        let results = coord
            .run_batch(&CancellationToken::new(), &[], None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
