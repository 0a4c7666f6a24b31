//! Mock LLM 客户端（用于测试，无需 API）
//!
//! - MockLlmClient：若可见工具中有 echo，先对用户最后一条消息发起 echo 调用，拿到工具结果后回显为最终回答；
//!   否则直接回显。便于本地跑通完整的工具调用循环。
//! - ScriptedLlmClient：按队列依次返回预设回复并记录每次请求，供单元与集成测试驱动确定性的对话。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmReply};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::ToolSchema;

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient {
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<LlmReply, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        let last = messages.iter().rev().find(|m| m.role != Role::System);

        match last {
            Some(m) if m.role == Role::Tool => {
                Ok(LlmReply::text(format!("Echo from Mock: {}", m.text())))
            }
            Some(m) if m.role == Role::User && tools.iter().any(|t| t.name == "echo") => {
                Ok(LlmReply::tool_calls(vec![ToolCall::new(
                    format!("mock_call_{}", n),
                    "echo",
                    serde_json::json!({ "text": m.text() }),
                )]))
            }
            Some(m) => Ok(LlmReply::text(format!("Echo from Mock: {}", m.text()))),
            None => Ok(LlmReply::text("Echo from Mock: (no input)")),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 一次被记录的请求：消息快照与当时可见的工具名
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

/// 脚本化客户端：按顺序弹出预设回复；队列耗尽后返回 fallback（未设置则报错）
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<LlmReply, LlmError>>>,
    fallback: Option<LlmReply>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new(replies: impl IntoIterator<Item = LlmReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// 追加一个传输错误
    pub fn then_error(self, err: LlmError) -> Self {
        lock(&self.replies).push_back(Err(err));
        self
    }

    /// 队列耗尽后一直返回该回复（用于测试轮数上限）
    pub fn with_fallback(mut self, reply: LlmReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// 每次回复前等待（用于测试取消与并发）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<LlmReply, LlmError> {
        lock(&self.requests).push(RecordedRequest {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = lock(&self.replies).pop_front();
        match next {
            Some(r) => r,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Malformed("script exhausted".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
