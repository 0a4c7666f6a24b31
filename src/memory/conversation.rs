//! 会话状态：有序消息日志
//!
//! 消息只追加、不修改；超出 token 预算时从头部按「轮次组」裁剪（system 消息永不裁剪，
//! 带 tool_calls 的 assistant 消息与其 tool 回复作为一组整体移除，保证每条 tool 消息都能找到对应调用）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::TokenEstimator;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型发出的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// 待执行的工具调用：content 为空
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, None)
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::with_role(Role::Tool, Some(content.into()))
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// 估算该消息占用的 token（内容 + 工具调用名与参数 + 固定开销）
    pub fn estimated_tokens(&self) -> usize {
        let mut tokens = 4 + self.content.as_deref().map(TokenEstimator::estimate).unwrap_or(0);
        for call in &self.tool_calls {
            tokens += TokenEstimator::estimate(&call.name);
            tokens += TokenEstimator::estimate(&call.arguments.to_string());
        }
        tokens
    }
}

/// 会话状态：一个引擎独占一份
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    /// 以 system prompt 开头的新会话
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// 一次性提交一轮暂存的消息（assistant 调用 + 全部 tool 回复）
    pub fn commit(&mut self, round: Vec<Message>) {
        self.messages.extend(round);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 清空历史，仅保留开头的 system 消息
    pub fn clear_history(&mut self) {
        let keep = self.head_len();
        self.messages.truncate(keep);
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(Message::estimated_tokens).sum()
    }

    /// 从头部裁剪直到总估算 token 不超过 budget，返回移除的消息条数。
    /// system 消息与最后一条 user 消息及其之后的内容（当前这一轮）永不裁剪；
    /// 没有 user 消息时至少保留最后一组。
    pub fn fit_to_budget(&mut self, budget: usize) -> usize {
        let head = self.head_len();
        let mut keep_from = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .map_or(self.messages.len(), |i| i.max(head));
        let mut total = self.estimated_tokens();
        let mut removed = 0;

        while total > budget {
            let group_end = self.group_end(head);
            if group_end > keep_from || group_end >= self.messages.len() {
                break;
            }
            let dropped: usize = self.messages[head..group_end]
                .iter()
                .map(Message::estimated_tokens)
                .sum();
            self.messages.drain(head..group_end);
            total = total.saturating_sub(dropped);
            removed += group_end - head;
            keep_from -= group_end - head;
        }

        if removed > 0 {
            tracing::debug!(removed, remaining = self.messages.len(), "conversation truncated");
        }
        removed
    }

    fn head_len(&self) -> usize {
        self.messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count()
    }

    /// 从 start 开始的一组消息的结束下标（不含）：带 tool_calls 的 assistant 连同其后的 tool 消息算一组，
    /// 头部遗留的孤立 tool 消息也并入同一组
    fn group_end(&self, start: usize) -> usize {
        let mut end = start + 1;
        while end < self.messages.len() && self.messages[end].role == Role::Tool {
            end += 1;
        }
        end
    }
}
