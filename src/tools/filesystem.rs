//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool / WriteFileTool 基于 SafeFs，均为阻塞工具，在工作池中执行。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{Tool, ToolKind};

/// 单次读取返回的最大字符数
const MAX_READ_CHARS: usize = 20_000;

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

    /// 解析已存在的路径并检查是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {}", path)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    /// 解析待写入的路径（文件可不存在）：只允许普通相对分量
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = Path::new(path.trim_start_matches("./"));
        if rel.as_os_str().is_empty() {
            return Err(AgentError::InvalidArguments("path is required".to_string()));
        }
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AgentError::PathEscape(path.to_string()));
        }
        Ok(self.root_dir.join(rel))
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {}", e)))?;
        if content.chars().count() > MAX_READ_CHARS {
            let head: String = content.chars().take(MAX_READ_CHARS).collect();
            Ok(format!("{}\n...[file truncated]", head))
        } else {
            Ok(content)
        }
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<usize, AgentError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {}", e)))?;
        }
        std::fs::write(&target, content)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {}", e)))?;
        Ok(content.len())
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn path_schema(extra: Option<(&str, &str)>) -> Value {
    let mut schema = serde_json::json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": "Path relative to the workspace root" }
        },
        "required": ["path"]
    });
    if let Some((key, desc)) = extra {
        schema["properties"][key] = serde_json::json!({ "type": "string", "description": desc });
        if let Some(required) = schema["required"].as_array_mut() {
            required.push(Value::String(key.to_string()));
        }
    }
    schema
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(None)
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Blocking
    }

    fn execute_blocking(&self, args: Value) -> Result<String, String> {
        let path = str_arg(&args, "path").unwrap_or("");
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(path).map_err(|e| e.to_string())
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory (default '.')."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Blocking
    }

    fn execute_blocking(&self, args: Value) -> Result<String, String> {
        let path = str_arg(&args, "path").unwrap_or(".");
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        Ok(entries.join("\n"))
    }
}

/// 写入文件（覆盖）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text content to a workspace file, replacing it."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(Some(("content", "Full file content")))
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Blocking
    }

    fn mutates(&self) -> bool {
        true
    }

    fn execute_blocking(&self, args: Value) -> Result<String, String> {
        let path = str_arg(&args, "path").unwrap_or("");
        let content = str_arg(&args, "content").ok_or("missing 'content'")?;
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        let n = self.fs.write_file(path, content).map_err(|e| e.to_string())?;
        Ok(format!("Wrote {} bytes to {}", n, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "x,y\n1,2\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let read = ReadFileTool::new(dir.path());
        assert_eq!(
            read.execute_blocking(json!({"path": "a.csv"})).unwrap(),
            "x,y\n1,2\n"
        );

        let list = ListDirTool::new(dir.path());
        assert_eq!(list.execute_blocking(json!({})).unwrap(), "a.csv\nsub/");
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "s").unwrap();

        let fs = SafeFs::new(dir.path().join("inner"));
        assert!(matches!(
            fs.resolve("../secret.txt"),
            Err(AgentError::PathEscape(_))
        ));
        assert!(matches!(
            fs.resolve_for_write("../secret.txt"),
            Err(AgentError::PathEscape(_))
        ));
    }

    #[test]
    fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        assert!(write.mutates());
        let out = write
            .execute_blocking(json!({"path": "out/report.md", "content": "done"}))
            .unwrap();
        assert!(out.contains("4 bytes"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/report.md")).unwrap(),
            "done"
        );
        assert!(write.execute_blocking(json!({"path": "x.md"})).is_err());
    }
}
