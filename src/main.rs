//! Hive CLI
//!
//! 用法：`hive [--config <path>] <goal...>`。执行一个目标，过程事件写入日志，Ctrl+C 取消。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::{
    agent::create_runtime,
    config::load_config,
    observability,
    react::{ProgressEvent, ProgressSink},
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut goal_parts = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = Some(args.next().context("--config requires a path")?.into());
        } else {
            goal_parts.push(arg);
        }
    }
    let goal = goal_parts.join(" ");
    if goal.trim().is_empty() {
        bail!("usage: hive [--config <path>] <goal>");
    }

    let cfg = load_config(config_path).context("Failed to load config")?;
    let _ = std::fs::create_dir_all(cfg.app.workspace());
    let runtime = create_runtime(&cfg)
        .await
        .context("Failed to create runtime")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl+C received, cancelling task");
            ctrl_c.cancel();
        }
    });

    let (sink, mut events) = ProgressSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            match &envelope.event {
                ProgressEvent::FinalAnswer { .. } | ProgressEvent::TokenUsage { .. } => {}
                event => match serde_json::to_string(event) {
                    Ok(json) => tracing::info!(
                        task_id = %envelope.task_id,
                        parent = envelope.parent_task_id.as_deref().unwrap_or("-"),
                        "{json}"
                    ),
                    Err(e) => tracing::debug!(error = %e, "unserialisable event"),
                },
            }
        }
    });

    let outcome = runtime.run_goal(&cancel, &goal, Some(sink)).await;
    let _ = printer.await;

    match outcome {
        Ok(result) => {
            println!("{}", result.answer);
            tracing::info!(
                iterations = result.iterations,
                tokens = result.tokens.total,
                confidence = result.confidence,
                "done"
            );
            Ok(())
        }
        Err(failure) => {
            if let Some(partial) = failure.result.partial_output() {
                println!("{partial}");
            }
            Err(anyhow::Error::new(failure.error)).context("Task failed")
        }
    }
}
