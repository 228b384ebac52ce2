//! 执行层：Planner（提示与解析）、工具分派、进度事件、任务执行主循环

pub mod dispatch;
pub mod events;
pub mod loop_;
pub mod planner;

pub use dispatch::{parse_delegation_goals, DispatchPlan, DELEGATION_TOOL};
pub use events::{ProgressEnvelope, ProgressEvent, ProgressSink};
pub use loop_::{EngineConfig, TaskEngine};
pub use planner::{decide, parse_llm_output, Planner, PlannerOutput, DEFAULT_SYSTEM_PROMPT};
