//! Agent 引擎：单会话的工具调用运行时
//!
//! 每个会话独占一个 AgentEngine（会话状态 + 工具作用域状态）。handle_message 处理一条用户消息：
//! 先识别 `/capability` 斜杠命令（确定性激活，不经模型选择），再运行工具调用循环；
//! 元工具 activate_capability / delegate_task 在通用分发之前被拦截。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentComponents, AgentError};
use crate::memory::{ConversationState, Message, ToolCall};
use crate::react::events::{send_event, AgentEvent, EventSender};
use crate::react::loop_::{run_tool_loop, LoopContext, LoopLimits, LoopOutcome, ToolDispatch};
use crate::react::scope::{
    is_meta_tool, scoped_tools, ActivateCapabilityArgs, DelegateTaskArgs, ScopedTools,
    ToolScopeState, ACTIVATE_CAPABILITY,
};
use crate::react::subagent::subagent_tool_text;
use crate::tools::{ToolCallResult, ToolSchema};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Tally, a task assistant. Use the available tools to complete the user's request. Activate a capability pack when the task needs its tools, and delegate self-contained sub-tasks when helpful.";

/// 引擎运行参数（由配置派生，会话间共享）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub system_prompt: String,
    pub limits: LoopLimits,
    pub subagent_limits: LoopLimits,
    /// 0 表示不裁剪
    pub token_budget: usize,
    /// 只读委派时剔除的写工具
    pub write_tools: BTreeSet<String>,
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            system_prompt: cfg
                .app
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            limits: LoopLimits {
                max_iterations: cfg.agent.max_iterations,
                max_consecutive_failures: cfg.agent.max_consecutive_failures,
            },
            subagent_limits: LoopLimits {
                max_iterations: cfg.subagent.max_iterations,
                max_consecutive_failures: cfg.subagent.max_consecutive_failures,
            },
            token_budget: cfg.agent.context_token_budget,
            write_tools: cfg.tools.write_tool_set(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 本次请求的路由方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// 斜杠命令直接激活
    Direct,
    /// 结束时有能力包处于激活状态
    Active,
    /// 无激活能力包，模型可从目录中自选
    Catalog,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Direct => "direct",
            RouteMode::Active => "active",
            RouteMode::Catalog => "catalog",
        }
    }
}

/// 一次请求的结果与元数据
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub capabilities_used: Vec<String>,
    /// 回合结束时模型可见的工具名（含元工具）
    pub tool_scope: Vec<String>,
    /// 作用域状态标签，如 `inactive` / `capability:data-basic`
    pub scope_state: String,
    pub route_mode: RouteMode,
    pub outcome: LoopOutcome,
    pub iterations: usize,
    pub tool_calls: usize,
}

impl TurnOutcome {
    pub fn truncated(&self) -> bool {
        self.outcome == LoopOutcome::Truncated
    }

    pub fn circuit_broken(&self) -> bool {
        self.outcome == LoopOutcome::CircuitBroken
    }
}

pub struct AgentEngine {
    session_id: String,
    components: Arc<AgentComponents>,
    conversation: ConversationState,
    scope: ToolScopeState,
}

impl AgentEngine {
    pub fn new(session_id: impl Into<String>, components: Arc<AgentComponents>) -> Self {
        let conversation = ConversationState::new(&components.settings.system_prompt);
        Self {
            session_id: session_id.into(),
            components,
            conversation,
            scope: ToolScopeState::Inactive,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn scope(&self) -> &ToolScopeState {
        &self.scope
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// 清空历史并回到 Inactive
    pub fn reset(&mut self) {
        self.conversation.clear_history();
        self.scope = ToolScopeState::Inactive;
    }

    /// 当前作用域下模型可见的工具名
    pub fn visible_tool_names(&self) -> Vec<String> {
        let caps = self.components.router.snapshot();
        scoped_tools(&self.scope, &self.components.tools, &caps).names()
    }

    /// 处理一条用户消息。模型传输错误与取消以 Err 返回；工具与路由错误在循环内回灌给模型。
    pub async fn handle_message(
        &mut self,
        message: &str,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<TurnOutcome, AgentError> {
        self.scope.recover_stale();

        let mut capabilities_used: Vec<String> = self
            .scope
            .active_capability()
            .map(|c| vec![c.to_string()])
            .unwrap_or_default();
        let mut direct = false;
        let mut user_text = message.to_string();

        if let Some((cap, rest)) = self.components.router.route_slash(message) {
            tracing::info!(session_id = %self.session_id, capability = %cap.id, "direct capability activation");
            self.scope.activate(cap.id.clone());
            note_capability(&mut capabilities_used, &cap.id);
            direct = true;

            if rest.is_empty() {
                let reply = format!("Capability `{}` activated.", cap.id);
                self.conversation.push(Message::user(message));
                self.conversation.push(Message::assistant(reply.clone()));
                send_event(events, AgentEvent::Reply { text: reply.clone() });
                return Ok(TurnOutcome {
                    reply,
                    capabilities_used,
                    tool_scope: self.visible_tool_names(),
                    scope_state: self.scope.label(),
                    route_mode: RouteMode::Direct,
                    outcome: LoopOutcome::Completed,
                    iterations: 0,
                    tool_calls: 0,
                });
            }
            user_text = rest;
        }

        self.conversation.push(Message::user(user_text));

        let components = Arc::clone(&self.components);
        let settings = &components.settings;
        let ctx = LoopContext {
            llm: components.llm.as_ref(),
            limits: settings.limits,
            cancel,
            events,
            token_budget: settings.token_budget,
        };
        let mut dispatch = EngineDispatch {
            components: &components,
            scope: &mut self.scope,
            capabilities_used: &mut capabilities_used,
        };
        let report = run_tool_loop(&ctx, &mut self.conversation, &mut dispatch).await?;

        let route_mode = if direct {
            RouteMode::Direct
        } else if self.scope.active_capability().is_some() {
            RouteMode::Active
        } else {
            RouteMode::Catalog
        };

        tracing::info!(
            session_id = %self.session_id,
            route_mode = route_mode.as_str(),
            scope = %self.scope.label(),
            iterations = report.iterations,
            outcome = ?report.outcome,
            "turn finished"
        );

        Ok(TurnOutcome {
            tool_calls: report.tool_results.len(),
            reply: report.reply,
            capabilities_used,
            tool_scope: self.visible_tool_names(),
            scope_state: self.scope.label(),
            route_mode,
            outcome: report.outcome,
            iterations: report.iterations,
        })
    }
}

fn note_capability(used: &mut Vec<String>, id: &str) {
    if !used.iter().any(|c| c == id) {
        used.push(id.to_string());
    }
}

/// 引擎侧分发：每次调用都按当前作用域重新计算可见工具，使同一轮内先前的激活对后续调用生效
struct EngineDispatch<'a> {
    components: &'a AgentComponents,
    scope: &'a mut ToolScopeState,
    capabilities_used: &'a mut Vec<String>,
}

impl EngineDispatch<'_> {
    fn current(&self) -> ScopedTools {
        let caps = self.components.router.snapshot();
        scoped_tools(&*self.scope, &self.components.tools, &caps)
    }

    fn activate(&mut self, call: &ToolCall) -> ToolCallResult {
        let args: ActivateCapabilityArgs = match serde_json::from_value(call.arguments.clone()) {
            Ok(a) => a,
            Err(e) => {
                return ToolCallResult::failed(call, &AgentError::InvalidArguments(e.to_string()))
            }
        };
        let Some(cap) = self.components.router.resolve(&args.capability) else {
            tracing::debug!(requested = %args.capability, "unknown capability requested");
            return ToolCallResult::failed(call, &AgentError::UnknownCapability(args.capability));
        };

        self.scope.activate(cap.id.clone());
        note_capability(self.capabilities_used, &cap.id);
        let tools = self.current().names().join(", ");
        tracing::info!(capability = %cap.id, "capability activated by model");
        ToolCallResult::ok(
            call,
            format!("Capability `{}` activated. Tools now available: {}", cap.id, tools),
        )
    }

    async fn delegate(
        &mut self,
        call: &ToolCall,
        view: crate::tools::ToolView,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        let args: DelegateTaskArgs = match serde_json::from_value(call.arguments.clone()) {
            Ok(a) => a,
            Err(e) => {
                return ToolCallResult::failed(call, &AgentError::InvalidArguments(e.to_string()))
            }
        };
        let settings = &self.components.settings;
        let view = if args.read_only {
            view.read_only(&settings.write_tools)
        } else {
            view
        };

        self.scope.begin_subagent();
        let result = self
            .components
            .subagents
            .run_with_cancel(&args.task, view, settings.subagent_limits, cancel)
            .await;
        self.scope.end_subagent();

        ToolCallResult {
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result_text: subagent_tool_text(&result),
            success: result.success,
            error: result.error,
        }
    }
}

#[async_trait]
impl ToolDispatch for EngineDispatch<'_> {
    fn visible_tools(&self) -> Vec<ToolSchema> {
        self.current().schemas()
    }

    async fn dispatch(&mut self, call: &ToolCall, cancel: &CancellationToken) -> ToolCallResult {
        let scoped = self.current();
        // 当前作用域未提供的元工具与其他未知工具一样交给执行器，得到 tool_not_available
        if is_meta_tool(&call.name) && scoped.has_meta(&call.name) {
            return match call.name.as_str() {
                ACTIVATE_CAPABILITY => self.activate(call),
                _ => self.delegate(call, scoped.view, cancel).await,
            };
        }
        self.components
            .executor
            .invoke(&scoped.view, call, cancel)
            .await
    }
}
