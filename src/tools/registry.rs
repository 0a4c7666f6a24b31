//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 注册表构建完成后以 Arc 形式在会话间只读共享；需要更新时整体替换。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::ToolSchema;

/// 工具的执行方式：异步工具直接在调度器上 await；阻塞工具交给有界工作池
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolKind {
    #[default]
    Async,
    Blocking,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、执行（args 为 JSON）
///
/// 异步工具实现 `execute`；阻塞工具返回 `ToolKind::Blocking` 并实现 `execute_blocking`。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（与模型 tool_calls 中的 name 对应）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Async
    }

    /// 是否有写副作用；只读委派会剔除这类工具
    fn mutates(&self) -> bool {
        false
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        Err(format!("{} has no async entry point", self.name()))
    }

    fn execute_blocking(&self, _args: Value) -> Result<String, String> {
        Err(format!("{} has no blocking entry point", self.name()))
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(self.name(), self.description(), self.parameters_schema())
    }
}

/// 工具注册表：按名称有序存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous entry replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }


    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Tool>)> {
        self.tools.iter()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

type ToolFn = dyn Fn(Value) -> Result<String, String> + Send + Sync;

/// 闭包工具：{schema, invoke} 的最小实现，用于轻量工具与测试
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    kind: ToolKind,
    mutates: bool,
    f: Arc<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({ "type": "object", "properties": {} }),
            kind: ToolKind::Async,
            mutates: false,
            f: Arc::new(f),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// 标记为阻塞工具（在工作池中执行）
    pub fn blocking(mut self) -> Self {
        self.kind = ToolKind::Blocking;
        self
    }

    /// 标记为写工具
    pub fn mutating(mut self) -> Self {
        self.mutates = true;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn mutates(&self) -> bool {
        self.mutates
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        (self.f)(args)
    }

    fn execute_blocking(&self, args: Value) -> Result<String, String> {
        (self.f)(args)
    }
}
