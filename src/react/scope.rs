//! 工具作用域状态机
//!
//! Inactive：通用工具（未被任何能力包声明的工具）+ 元工具；
//! CapabilityActive(c)：仅 c 声明的工具 + 切换能力包的元工具（c 显式声明 delegate_task 时也可委派）；
//! SubagentRunning：父循环挂起，父视图为空，结束后恢复进入前的状态。
//! 每轮都基于当前能力包快照重新计算可见工具，目录变化后不会沿用旧列表。

use std::collections::BTreeSet;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::capability::CapabilityRegistry;
use crate::tools::{args_schema, ToolRegistry, ToolSchema, ToolView};

pub const ACTIVATE_CAPABILITY: &str = "activate_capability";
pub const DELEGATE_TASK: &str = "delegate_task";
/// 由引擎拦截、不进入通用分发的工具名
pub const META_TOOLS: [&str; 2] = [ACTIVATE_CAPABILITY, DELEGATE_TASK];

pub fn is_meta_tool(name: &str) -> bool {
    META_TOOLS.contains(&name)
}

/// activate_capability 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ActivateCapabilityArgs {
    /// Capability id to activate
    #[serde(alias = "id", alias = "name")]
    pub capability: String,
}

/// delegate_task 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DelegateTaskArgs {
    /// Self-contained description of the sub-task
    pub task: String,
    /// Restrict the subagent to tools without side effects
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

fn default_read_only() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolScopeState {
    #[default]
    Inactive,
    CapabilityActive(String),
    SubagentRunning { prior: Box<ToolScopeState> },
}

impl ToolScopeState {
    /// 切换到能力包；委派进行中不允许切换
    pub fn activate(&mut self, capability_id: impl Into<String>) -> bool {
        match self {
            ToolScopeState::SubagentRunning { .. } => false,
            _ => {
                *self = ToolScopeState::CapabilityActive(capability_id.into());
                true
            }
        }
    }

    pub fn begin_subagent(&mut self) {
        let prior = std::mem::take(self);
        *self = ToolScopeState::SubagentRunning {
            prior: Box::new(prior),
        };
    }

    /// 恢复进入委派前的状态
    pub fn end_subagent(&mut self) {
        if let ToolScopeState::SubagentRunning { prior } = std::mem::take(self) {
            *self = *prior;
        } else {
            tracing::warn!("end_subagent called outside a delegation");
        }
    }

    /// 上一次委派被中断（如请求取消）时残留的 SubagentRunning 在新一轮开始前复原
    pub fn recover_stale(&mut self) {
        if self.is_subagent_running() {
            tracing::warn!("recovering scope left in subagent state");
            self.end_subagent();
        }
    }

    pub fn is_subagent_running(&self) -> bool {
        matches!(self, ToolScopeState::SubagentRunning { .. })
    }

    pub fn active_capability(&self) -> Option<&str> {
        match self {
            ToolScopeState::CapabilityActive(id) => Some(id),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ToolScopeState::Inactive => "inactive".to_string(),
            ToolScopeState::CapabilityActive(id) => format!("capability:{}", id),
            ToolScopeState::SubagentRunning { .. } => "subagent".to_string(),
        }
    }
}

/// 某一状态下模型可见的工具：普通工具视图 + 元工具声明
#[derive(Debug, Clone)]
pub struct ScopedTools {
    pub view: ToolView,
    pub meta: Vec<ToolSchema>,
}

impl ScopedTools {
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut all = self.view.schemas();
        all.extend(self.meta.iter().cloned());
        all
    }

    pub fn has_meta(&self, name: &str) -> bool {
        self.meta.iter().any(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.view.names();
        names.extend(self.meta.iter().map(|m| m.name.clone()));
        names
    }
}

/// 计算给定状态下的可见工具
pub fn scoped_tools(
    state: &ToolScopeState,
    tools: &Arc<ToolRegistry>,
    capabilities: &CapabilityRegistry,
) -> ScopedTools {
    match state {
        ToolScopeState::Inactive => {
            let claimed: BTreeSet<&str> = capabilities
                .iter()
                .flat_map(|c| c.allowed_tools.iter().map(String::as_str))
                .collect();
            let view = ToolView::all(Arc::clone(tools))
                .retain(|t| !claimed.contains(t.name()))
                .without(META_TOOLS);
            let mut meta = Vec::new();
            if !capabilities.is_empty() {
                meta.push(activation_schema(capabilities));
            }
            meta.push(delegate_schema());
            ScopedTools { view, meta }
        }
        ToolScopeState::CapabilityActive(id) => {
            let cap = capabilities.get(id);
            if cap.is_none() {
                // 刷新后能力包已被移除：只保留切换入口
                tracing::warn!(capability = %id, "active capability no longer registered");
            }
            let view = match cap {
                Some(c) => ToolView::only(Arc::clone(tools), c.allowed_tools.iter()),
                None => ToolView::empty(Arc::clone(tools)),
            }
            .without(META_TOOLS);
            let mut meta = vec![activation_schema(capabilities)];
            if cap.is_some_and(|c| c.allows(DELEGATE_TASK)) {
                meta.push(delegate_schema());
            }
            ScopedTools { view, meta }
        }
        ToolScopeState::SubagentRunning { .. } => ScopedTools {
            view: ToolView::empty(Arc::clone(tools)),
            meta: Vec::new(),
        },
    }
}

/// activate_capability 声明：枚举值为当前全部能力包 id，描述中列出目录
pub fn activation_schema(capabilities: &CapabilityRegistry) -> ToolSchema {
    let mut parameters = args_schema::<ActivateCapabilityArgs>();
    if let Some(prop) = parameters.pointer_mut("/properties/capability") {
        prop["enum"] = serde_json::json!(capabilities.ids());
    }
    let description = format!(
        "Activate a capability pack to get its tools. Available capabilities:\n{}",
        capabilities.catalog_summary()
    );
    ToolSchema::new(ACTIVATE_CAPABILITY, description, parameters)
}

pub fn delegate_schema() -> ToolSchema {
    ToolSchema::new(
        DELEGATE_TASK,
        "Hand a self-contained sub-task to an isolated helper with its own budget. Returns the helper's summary.",
        args_schema::<DelegateTaskArgs>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::tools::{EchoTool, FnTool};

    fn tools() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(FnTool::new("read_sheet", "r", |_| Ok(String::new())));
        reg.register(FnTool::new("write_sheet", "w", |_| Ok(String::new())).mutating());
        reg.register(FnTool::new("plot", "p", |_| Ok(String::new())));
        Arc::new(reg)
    }

    fn caps() -> CapabilityRegistry {
        CapabilityRegistry::new([
            Capability::new("data-basic", "Tables", ["read_sheet", "write_sheet", DELEGATE_TASK]),
            Capability::new("charts", "Charts", ["plot", "ghost_tool"]),
        ])
    }

    #[test]
    fn test_transitions() {
        let mut state = ToolScopeState::Inactive;
        assert!(state.activate("data-basic"));
        assert_eq!(state.active_capability(), Some("data-basic"));
        assert!(state.activate("charts"));

        state.begin_subagent();
        assert!(state.is_subagent_running());
        assert!(!state.activate("data-basic"));
        state.end_subagent();
        assert_eq!(state, ToolScopeState::CapabilityActive("charts".into()));

        let mut stale = ToolScopeState::Inactive;
        stale.begin_subagent();
        stale.recover_stale();
        assert_eq!(stale, ToolScopeState::Inactive);
        assert_eq!(stale.label(), "inactive");
    }

    #[test]
    fn test_inactive_shows_general_tools_and_catalog() {
        let scoped = scoped_tools(&ToolScopeState::Inactive, &tools(), &caps());
        assert_eq!(scoped.view.names(), vec!["echo"]);
        assert!(scoped.has_meta(ACTIVATE_CAPABILITY));
        assert!(scoped.has_meta(DELEGATE_TASK));

        let activation = &scoped.meta[0];
        assert_eq!(
            activation.parameters["properties"]["capability"]["enum"],
            serde_json::json!(["charts", "data-basic"])
        );
        assert!(activation.description.contains("data-basic: Tables"));
    }

    #[test]
    fn test_active_capability_narrows_view() {
        let state = ToolScopeState::CapabilityActive("charts".into());
        let scoped = scoped_tools(&state, &tools(), &caps());
        assert_eq!(scoped.view.names(), vec!["plot"]);
        assert!(scoped.has_meta(ACTIVATE_CAPABILITY));
        assert!(!scoped.has_meta(DELEGATE_TASK));

        let state = ToolScopeState::CapabilityActive("data-basic".into());
        let scoped = scoped_tools(&state, &tools(), &caps());
        assert_eq!(scoped.view.names(), vec!["read_sheet", "write_sheet"]);
        assert!(scoped.has_meta(DELEGATE_TASK));
    }

    #[test]
    fn test_catalog_rebuilt_from_current_snapshot() {
        let mut reg = caps();
        let before = scoped_tools(&ToolScopeState::Inactive, &tools(), &reg);
        reg = CapabilityRegistry::new(
            reg.iter()
                .cloned()
                .chain([Capability::new("reports", "Reports", Vec::<String>::new())]),
        );
        let after = scoped_tools(&ToolScopeState::Inactive, &tools(), &reg);
        assert!(!before.meta[0].description.contains("reports"));
        assert!(after.meta[0].description.contains("reports: Reports"));
    }

    #[test]
    fn test_subagent_running_hides_everything() {
        let mut state = ToolScopeState::Inactive;
        state.begin_subagent();
        let scoped = scoped_tools(&state, &tools(), &caps());
        assert!(scoped.view.is_empty());
        assert!(scoped.meta.is_empty());
    }

    #[test]
    fn test_delegate_args_default_read_only() {
        let args: DelegateTaskArgs = serde_json::from_value(serde_json::json!({"task": "t"})).unwrap();
        assert!(args.read_only);
        let args: ActivateCapabilityArgs =
            serde_json::from_value(serde_json::json!({"id": "charts"})).unwrap();
        assert_eq!(args.capability, "charts");
    }
}
