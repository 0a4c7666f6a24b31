//! Tally - Rust 任务智能体运行时
//!
//! 模块划分：
//! - **agent**: 单会话 AgentEngine（斜杠路由、元工具拦截、作用域工具循环）
//! - **capability**: 能力包定义、目录加载与斜杠命令路由
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、组件构建器、阻塞任务调度
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 会话消息序列与上下文预算
//! - **react**: 工具调用循环、作用域状态机、子智能体、事件
//! - **session**: 会话准入、空闲回收与请求串行化
//! - **tools**: 工具注册表、视图过滤与执行器
//! - **web**: HTTP 接口（feature = "web"）

pub mod agent;
pub mod capability;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod session;
pub mod tools;
#[cfg(feature = "web")]
pub mod web;

pub use agent::{AgentEngine, RouteMode, TurnOutcome};
pub use session::{ChatResponse, SessionManager};
