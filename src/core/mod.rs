//! 核心层：错误类型、组件构建、阻塞任务调度

pub mod builder;
pub mod error;
pub mod task_scheduler;

pub use builder::{create_agent_builder, create_llm_from_config, AgentBuilder, AgentComponents};
pub use error::AgentError;
pub use task_scheduler::TaskScheduler;
