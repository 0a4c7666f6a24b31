//! 工具视图：注册表的只读过滤投影
//!
//! 视图只保存允许的工具名集合与注册表的 Arc，本身不可变；收窄操作（without / read_only）返回新视图。
//! 「当前只能调用这些工具」由视图保证：不在视图内的名字一律不可执行。

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::tools::{Tool, ToolRegistry, ToolSchema};

#[derive(Clone)]
pub struct ToolView {
    registry: Arc<ToolRegistry>,
    allowed: BTreeSet<String>,
}

impl ToolView {
    /// 注册表中的全部工具
    pub fn all(registry: Arc<ToolRegistry>) -> Self {
        let allowed = registry.tool_names().into_iter().collect();
        Self { registry, allowed }
    }

    /// 仅包含给定名字中已注册的工具；未知名字被忽略
    pub fn only<I, S>(registry: Arc<ToolRegistry>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .filter(|n| registry.contains(n))
            .collect();
        Self { registry, allowed }
    }

    pub fn empty(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            allowed: BTreeSet::new(),
        }
    }

    /// 去掉给定名字后的新视图
    pub fn without<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = self.allowed.clone();
        for n in names {
            allowed.remove(n.as_ref());
        }
        Self {
            registry: Arc::clone(&self.registry),
            allowed,
        }
    }

    /// 只保留满足谓词的工具
    pub fn retain(&self, pred: impl Fn(&dyn Tool) -> bool) -> Self {
        let allowed = self
            .allowed
            .iter()
            .filter(|n| {
                self.registry
                    .get(n)
                    .map(|t| pred(t.as_ref()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Self {
            registry: Arc::clone(&self.registry),
            allowed,
        }
    }

    /// 只读视图：剔除自声明 mutates 的工具与配置中的写工具名单
    pub fn read_only(&self, write_tools: &BTreeSet<String>) -> Self {
        self.retain(|t| !t.mutates() && !write_tools.contains(t.name()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    /// 仅当名字在视图内时返回工具
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.contains(name) {
            self.registry.get(name)
        } else {
            None
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.allowed
            .iter()
            .filter_map(|n| self.registry.get(n))
            .map(|t| t.schema())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for ToolView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ToolView").field(&self.allowed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FnTool};

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(FnTool::new("read_cell", "read", |_| Ok(String::new())));
        reg.register(FnTool::new("write_cell", "write", |_| Ok(String::new())).mutating());
        reg.register(FnTool::new("delete_sheet", "delete", |_| Ok(String::new())));
        Arc::new(reg)
    }

    #[test]
    fn test_only_ignores_unknown_names() {
        let view = ToolView::only(registry(), ["echo", "nope"]);
        assert_eq!(view.names(), vec!["echo"]);
        assert!(view.get("read_cell").is_none());
        assert!(view.get("echo").is_some());
    }

    #[test]
    fn test_without_is_non_destructive() {
        let all = ToolView::all(registry());
        let narrowed = all.without(["echo"]);
        assert!(all.contains("echo"));
        assert!(!narrowed.contains("echo"));
        assert_eq!(narrowed.len(), all.len() - 1);
    }

    #[test]
    fn test_read_only_drops_writers() {
        let write_set: BTreeSet<String> = ["delete_sheet".to_string()].into_iter().collect();
        let view = ToolView::all(registry()).read_only(&write_set);
        assert_eq!(view.names(), vec!["echo", "read_cell"]);
        assert!(view
            .names()
            .iter()
            .all(|n| !write_set.contains(n) && n != "write_cell"));
    }

    #[test]
    fn test_schemas_follow_view() {
        let view = ToolView::only(registry(), ["read_cell"]);
        let schemas = view.schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "read_cell");
    }
}
