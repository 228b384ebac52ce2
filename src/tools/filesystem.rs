//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! CatTool / LsTool 基于 SafeFs 提供只读的 cat / ls 能力。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::core::AgentError;
use crate::tools::{Tool, ToolOutput};

/// ls 递归时的最大条目数
const MAX_LIST_ENTRIES: usize = 500;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 检查路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let path = path.trim_start_matches("./");
        if path.is_empty() || path == "." {
            return Ok(self.root_dir.clone());
        }
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {path}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {e}")))
    }

    /// 列出目录；目录名带 `/` 后缀，隐藏文件跳过，结果排序
    ///
    /// `pattern` 为 glob（匹配相对路径），`recursive` 时遍历子目录。
    pub fn list_dir(
        &self,
        path: &str,
        pattern: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<String>, AgentError> {
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Err(AgentError::ToolExecutionFailed(format!(
                "Not a directory: {path}"
            )));
        }
        let matcher = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Invalid pattern: {e}")))?;

        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if matcher.as_ref().is_some_and(|m| !m.matches(&rel)) {
                continue;
            }
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{rel}{suffix}"));
            if entries.len() >= MAX_LIST_ENTRIES {
                break;
            }
        }
        entries.sort();
        Ok(entries)
    }
}

/// Cat 工具：读取文件内容
pub struct CatTool {
    fs: SafeFs,
}

impl CatTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for CatTool {
    fn name(&self) -> &str {
        "cat"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "file path relative to workspace"}
            },
            "required": ["path"]
        })
    }

    fn tags(&self) -> Vec<String> {
        vec!["filesystem".to_string()]
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        tracing::info!(path = %path, "cat tool execute");
        self.fs
            .read_file(path)
            .map(ToolOutput::text)
            .map_err(|e| e.to_string())
    }
}

/// Ls 工具：列出目录
pub struct LsTool {
    fs: SafeFs,
}

impl LsTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List directory. Args: {\"path\": \"directory, default '.'\", \"pattern\": \"optional glob\", \"recursive\": false}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "directory path, default '.'"},
                "pattern": {"type": "string", "description": "glob filter on relative paths, e.g. *.rs"},
                "recursive": {"type": "boolean"}
            },
            "required": []
        })
    }

    fn tags(&self) -> Vec<String> {
        vec!["filesystem".to_string()]
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let pattern = args.get("pattern").and_then(|v| v.as_str());
        let recursive = args
            .get("recursive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        tracing::info!(path = %path, recursive, "ls tool execute");
        let entries = self
            .fs
            .list_dir(path, pattern, recursive)
            .map_err(|e| e.to_string())?;
        Ok(ToolOutput::text(entries.join("\n")).with_data(json!(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.rs"), "").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_ls_lists_sorted_without_hidden() {
        let dir = fixture();
        let out = LsTool::new(dir.path()).execute(json!({})).await.unwrap();
        assert_eq!(out.content, "a.txt\nb.rs\nsub/");
    }

    #[tokio::test]
    async fn test_ls_recursive_with_pattern() {
        let dir = fixture();
        let out = LsTool::new(dir.path())
            .execute(json!({"pattern": "*.rs", "recursive": true}))
            .await
            .unwrap();
        assert_eq!(out.data, Some(json!(["b.rs", "sub/c.rs"])));
    }

    #[tokio::test]
    async fn test_cat_reads_file() {
        let dir = fixture();
        let out = CatTool::new(dir.path())
            .execute(json!({"path": "a.txt"}))
            .await
            .unwrap();
        assert_eq!(out.content, "alpha");
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = fixture();
        let inner = dir.path().join("sub");
        let fs = SafeFs::new(&inner);
        assert!(matches!(
            fs.resolve("../a.txt"),
            Err(AgentError::PathEscape(_))
        ));
    }
}
