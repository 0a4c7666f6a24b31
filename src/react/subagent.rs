//! 子智能体执行器
//!
//! 在全新的会话状态（独立 system prompt + 任务作为首条用户消息）上，用同一个循环算法
//! 针对受限视图运行一次子任务。委派元工具永远不在子视图内（不可嵌套）。
//! 每次运行恰好产出一个 SubagentResult，子会话历史随之丢弃，父会话只看到有界长度的 summary_text。

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmClient;
use crate::memory::{truncate_chars, ConversationState, Message};
use crate::react::loop_::{run_tool_loop, LoopContext, LoopLimits, LoopOutcome, ViewDispatch};
use crate::react::scope::META_TOOLS;
use crate::tools::{ToolExecutor, ToolView};

const DEFAULT_SUBAGENT_PROMPT: &str = "You are a focused helper. Complete the given task using the available tools, then reply with a concise summary of the result.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubagentResult {
    pub success: bool,
    pub summary_text: String,
    pub iterations: usize,
    pub tool_call_count: usize,
    pub error: Option<String>,
}

impl SubagentResult {
    fn failed(summary_text: String, error: String, iterations: usize, tool_call_count: usize) -> Self {
        Self {
            success: false,
            summary_text,
            iterations,
            tool_call_count,
            error: Some(error),
        }
    }
}

pub struct SubagentExecutor {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    system_prompt: String,
    max_summary_chars: usize,
    token_budget: usize,
}

impl SubagentExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            llm,
            executor,
            system_prompt: DEFAULT_SUBAGENT_PROMPT.to_string(),
            max_summary_chars: 4000,
            token_budget: 0,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_summary_chars(mut self, max: usize) -> Self {
        self.max_summary_chars = max.max(1);
        self
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    pub async fn run(
        &self,
        task: &str,
        view: ToolView,
        max_iterations: usize,
        max_consecutive_failures: usize,
    ) -> SubagentResult {
        self.run_with_cancel(
            task,
            view,
            LoopLimits {
                max_iterations,
                max_consecutive_failures,
            },
            &CancellationToken::new(),
        )
        .await
    }

    /// 运行一次子任务；取消与模型传输错误也折叠为失败结果，由父循环作为工具结果处理
    pub async fn run_with_cancel(
        &self,
        task: &str,
        view: ToolView,
        limits: LoopLimits,
        cancel: &CancellationToken,
    ) -> SubagentResult {
        let view = view.without(META_TOOLS);
        tracing::info!(tools = ?view.names(), max_iterations = limits.max_iterations, "subagent started");

        let mut conversation = ConversationState::new(&self.system_prompt);
        conversation.push(Message::user(task));

        let ctx = LoopContext {
            llm: self.llm.as_ref(),
            limits,
            cancel,
            events: None,
            token_budget: self.token_budget,
        };
        let mut dispatch = ViewDispatch::new(&self.executor, view);

        let result = match run_tool_loop(&ctx, &mut conversation, &mut dispatch).await {
            Ok(report) => {
                let summary = self.bound(&report.reply);
                let calls = report.tool_results.len();
                match report.outcome {
                    LoopOutcome::Completed => SubagentResult {
                        success: true,
                        summary_text: summary,
                        iterations: report.iterations,
                        tool_call_count: calls,
                        error: None,
                    },
                    LoopOutcome::Truncated => SubagentResult::failed(
                        summary,
                        format!("iteration limit reached after {} rounds", report.iterations),
                        report.iterations,
                        calls,
                    ),
                    LoopOutcome::CircuitBroken => SubagentResult::failed(
                        summary,
                        "stopped after repeated tool failures".to_string(),
                        report.iterations,
                        calls,
                    ),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "subagent aborted");
                SubagentResult::failed(
                    format!("Subtask did not finish: {}", e.code()),
                    e.to_string(),
                    0,
                    0,
                )
            }
        };

        tracing::info!(
            success = result.success,
            iterations = result.iterations,
            tool_calls = result.tool_call_count,
            "subagent finished"
        );
        result
    }

    fn bound(&self, text: &str) -> String {
        let text = if text.trim().is_empty() {
            "(no summary)"
        } else {
            text
        };
        truncate_chars(text, self.max_summary_chars)
    }
}

/// 供父循环回灌的文本：成功即摘要，失败附带原因
pub fn subagent_tool_text(result: &SubagentResult) -> String {
    match (&result.error, result.success) {
        (Some(err), false) => format!("Subtask failed ({}): {}", err, result.summary_text),
        _ => result.summary_text.clone(),
    }
}
