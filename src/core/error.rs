//! Agent 错误类型
//!
//! 按处理方式分层：准入错误（容量）与传输错误（LLM）向调用方传播；
//! 路由错误与工具错误在循环内转为工具结果文本，交给模型再试一次。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 会话池已满，拒绝新建会话
    #[error("Session capacity exceeded ({capacity} active sessions)")]
    CapacityExceeded { capacity: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool panicked: {0}")]
    ToolPanicked(String),

    /// 工具不在当前作用域的视图内（含模型幻觉出的工具名）
    #[error("Tool not available in current scope: {0}")]
    ToolNotAvailable(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),
}

impl AgentError {
    /// 对外暴露的稳定错误标识，不含内部细节
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::CapacityExceeded { .. } => "capacity_exceeded",
            AgentError::SessionNotFound(_) => "session_not_found",
            AgentError::Cancelled => "cancelled",
            AgentError::Llm(_) => "llm_error",
            AgentError::ToolExecutionFailed(_) => "tool_failed",
            AgentError::ToolTimeout(_) => "tool_timeout",
            AgentError::ToolPanicked(_) => "tool_panicked",
            AgentError::ToolNotAvailable(_) => "tool_not_available",
            AgentError::UnknownCapability(_) => "unknown_capability",
            AgentError::InvalidArguments(_) => "invalid_arguments",
            AgentError::PathEscape(_) => "path_escape",
        }
    }

    /// 可对外展示的描述：不含上游响应体、路径等内部细节
    pub fn public_message(&self) -> String {
        match self {
            AgentError::CapacityExceeded { .. } => {
                "Too many active sessions, try again later".to_string()
            }
            AgentError::SessionNotFound(id) => format!("Session not found: {}", id),
            AgentError::Cancelled => "Request cancelled".to_string(),
            AgentError::Llm(_) => "Model request failed".to_string(),
            other => format!("Request failed ({})", other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            AgentError::CapacityExceeded { capacity: 4 }.code(),
            "capacity_exceeded"
        );
        assert_eq!(
            AgentError::Llm(LlmError::Timeout).code(),
            "llm_error"
        );
        assert_eq!(AgentError::SessionNotFound("x".into()).code(), "session_not_found");
    }

    #[test]
    fn test_public_message_hides_details() {
        let e = AgentError::Llm(LlmError::Request("stack trace at /srv/app.py".into()));
        assert_eq!(e.public_message(), "Model request failed");
        assert!(!AgentError::PathEscape("/etc/passwd".into())
            .public_message()
            .contains("/etc"));
    }
}
