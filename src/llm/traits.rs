//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化测试客户端）实现 LlmClient：给定消息历史与可见工具声明，
//! 返回一次回复（文本 + 可选的工具调用列表）。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{Message, ToolCall};
use crate::tools::ToolSchema;

/// 模型传输层错误；不在循环内重试，直接交给调用方
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("request timed out")]
    Timeout,
}

/// 模型的一次回复：tool_calls 为空即最终回答
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[ToolSchema])
        -> Result<LlmReply, LlmError>;

    /// 后端名（日志用）
    fn name(&self) -> &str {
        "llm"
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
