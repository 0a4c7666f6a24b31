//! 记忆层：会话内消息日志与 token 预算

pub mod conversation;
pub mod token_budget;

pub use conversation::{ConversationState, Message, Role, ToolCall};
pub use token_budget::{truncate_chars, TokenEstimator};
