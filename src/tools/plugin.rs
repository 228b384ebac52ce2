//! 命令插件：由配置 [[tools.plugins]] 声明，运行「程序 + 参数模板」
//!
//! 参数模板中 {{workspace}} 替换为工作目录，{{key}} 从调用参数中取 key；
//! 无 shell，直接 exec。插件作为动态来源提供：程序找不到时视为不可用。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::PluginEntry;
use crate::tools::source::DynamicToolProvider;
use crate::tools::{Tool, ToolOutput};

/// 从配置项构建的插件工具
pub struct PluginTool {
    entry: PluginEntry,
    workspace: PathBuf,
}

impl PluginTool {
    pub fn new(entry: &PluginEntry, workspace: &Path) -> Self {
        Self {
            entry: entry.clone(),
            workspace: workspace.to_path_buf(),
        }
    }

    /// 替换模板中的 {{workspace}} 和 {{key}}
    fn substitute(&self, args: &Value) -> Vec<String> {
        let workspace = self.workspace.to_string_lossy();
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.entry
            .args
            .iter()
            .map(|tpl| {
                let mut s = tpl.replace("{{workspace}}", &workspace);
                for (k, v) in obj {
                    let val = match v {
                        Value::String(x) => x.clone(),
                        other => other.to_string(),
                    };
                    s = s.replace(&format!("{{{{{k}}}}}"), &val);
                }
                s
            })
            .collect()
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn description(&self) -> &str {
        &self.entry.description
    }

    fn tags(&self) -> Vec<String> {
        vec!["plugin".to_string()]
    }

    fn is_read_only(&self) -> bool {
        self.entry.read_only
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let argv = self.substitute(&args);
        tracing::info!(tool = %self.entry.name, program = %self.entry.program, "plugin tool invoke");
        let child = Command::new(&self.entry.program)
            .args(&argv)
            .current_dir(&self.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("plugin spawn failed: {e}"))?;
        let output = tokio::time::timeout(
            Duration::from_secs(self.entry.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| format!("plugin timeout after {}s", self.entry.timeout_secs))?
        .map_err(|e| format!("plugin wait failed: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "exit {:?}: stderr {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        Ok(ToolOutput::text(stdout.trim()))
    }
}

/// 程序是否可执行：含路径分隔符时检查文件，否则在 PATH 中查找
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// 一个插件一个 provider
pub struct PluginProvider {
    id: String,
    tool: Arc<PluginTool>,
}

impl PluginProvider {
    pub fn new(entry: &PluginEntry, workspace: &Path) -> Self {
        Self {
            id: format!("plugin:{}", entry.name),
            tool: Arc::new(PluginTool::new(entry, workspace)),
        }
    }
}

#[async_trait]
impl DynamicToolProvider for PluginProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        program_exists(&self.tool.entry.program)
    }

    async fn provide(&self) -> Vec<Arc<dyn Tool>> {
        vec![Arc::clone(&self.tool) as Arc<dyn Tool>]
    }
}
