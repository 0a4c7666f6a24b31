//! 执行层：工具调用循环、作用域状态机、子智能体与过程事件

pub mod events;
pub mod loop_;
pub mod scope;
pub mod subagent;

pub use events::{AgentEvent, EventSender};
pub use loop_::{
    run_tool_loop, LoopContext, LoopLimits, LoopOutcome, LoopReport, ToolDispatch, ViewDispatch,
};
pub use scope::{scoped_tools, ScopedTools, ToolScopeState, ACTIVATE_CAPABILITY, DELEGATE_TASK};
pub use subagent::{SubagentExecutor, SubagentResult};
