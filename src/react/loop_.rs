//! 工具调用主循环
//!
//! 每轮：把消息与当前可见工具发给模型 -> 无工具调用则原样返回文本并结束 -> 否则按顺序逐个执行，
//! 每个调用对应一条 tool 消息（失败以文本回灌）-> 下一轮。
//! 轮数上限与连续失败熔断保证循环有界；一轮的消息先暂存，执行完再一次性提交。
//! 工具执行期间被取消时，已完成的调用连同其余调用的取消应答一并提交，然后返回 Cancelled。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{truncate_chars, ConversationState, Message, ToolCall};
use crate::react::events::{send_event, AgentEvent, EventSender};
use crate::tools::{ToolCallResult, ToolExecutor, ToolSchema, ToolView};

/// 熔断后未执行的调用用此文本应答，保证每个 tool_call_id 都有回复
pub const SKIPPED_TOOL_TEXT: &str = "Skipped: stopped after repeated tool failures";
/// 请求取消后未执行的调用用此文本应答
pub const CANCELLED_TOOL_TEXT: &str = "Skipped: request cancelled";
/// ToolCallEnd 事件中的结果预览长度
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_iterations: usize,
    pub max_consecutive_failures: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_consecutive_failures: 3,
        }
    }
}

/// 循环如何结束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// 模型给出最终回答
    Completed,
    /// 达到轮数上限
    Truncated,
    /// 连续失败达到阈值
    CircuitBroken,
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    pub reply: String,
    pub outcome: LoopOutcome,
    pub iterations: usize,
    pub tool_results: Vec<ToolCallResult>,
}

impl LoopReport {
    pub fn truncated(&self) -> bool {
        self.outcome == LoopOutcome::Truncated
    }

    pub fn circuit_broken(&self) -> bool {
        self.outcome == LoopOutcome::CircuitBroken
    }
}

/// 循环与工具分发之间的接缝：每轮取一次可见工具，按调用逐个分发。
/// 元工具的拦截与作用域切换在实现方完成，循环本身不感知。
#[async_trait]
pub trait ToolDispatch: Send {
    fn visible_tools(&self) -> Vec<ToolSchema>;

    async fn dispatch(&mut self, call: &ToolCall, cancel: &CancellationToken) -> ToolCallResult;
}

/// 固定视图的分发：直接交给 ToolExecutor
pub struct ViewDispatch<'a> {
    executor: &'a ToolExecutor,
    view: ToolView,
}

impl<'a> ViewDispatch<'a> {
    pub fn new(executor: &'a ToolExecutor, view: ToolView) -> Self {
        Self { executor, view }
    }
}

#[async_trait]
impl ToolDispatch for ViewDispatch<'_> {
    fn visible_tools(&self) -> Vec<ToolSchema> {
        self.view.schemas()
    }

    async fn dispatch(&mut self, call: &ToolCall, cancel: &CancellationToken) -> ToolCallResult {
        self.executor.invoke(&self.view, call, cancel).await
    }
}

/// 单次循环运行所需的上下文
pub struct LoopContext<'a> {
    pub llm: &'a dyn LlmClient,
    pub limits: LoopLimits,
    pub cancel: &'a CancellationToken,
    pub events: Option<&'a EventSender>,
    /// 0 表示不裁剪
    pub token_budget: usize,
}

/// 运行循环直到最终回答、轮数上限或熔断。调用方需先把用户消息放入 conversation。
///
/// 模型传输错误与取消以 Err 返回；工具层错误都已收敛为失败结果，不会在此处返回。
pub async fn run_tool_loop<D: ToolDispatch>(
    ctx: &LoopContext<'_>,
    conversation: &mut ConversationState,
    dispatch: &mut D,
) -> Result<LoopReport, AgentError> {
    let max_iterations = ctx.limits.max_iterations.max(1);
    let max_failures = ctx.limits.max_consecutive_failures.max(1);

    let mut iterations = 0;
    let mut consecutive_failures = 0;
    let mut tool_results: Vec<ToolCallResult> = Vec::new();
    let mut last_model_text: Option<String> = None;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        if iterations >= max_iterations {
            let reply = best_available_text(last_model_text.as_deref(), &tool_results, iterations);
            tracing::warn!(iterations, "tool loop reached iteration cap");
            conversation.push(Message::assistant(reply.clone()));
            send_event(ctx.events, AgentEvent::Reply { text: reply.clone() });
            return Ok(LoopReport {
                reply,
                outcome: LoopOutcome::Truncated,
                iterations,
                tool_results,
            });
        }

        iterations += 1;
        if ctx.token_budget > 0 {
            conversation.fit_to_budget(ctx.token_budget);
        }
        send_event(
            ctx.events,
            AgentEvent::Thinking {
                iteration: iterations,
                max_iterations,
            },
        );

        let tools = dispatch.visible_tools();
        let reply = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
            r = ctx.llm.complete(conversation.messages(), &tools) => r?,
        };

        if !reply.has_tool_calls() {
            let text = reply.content.unwrap_or_default();
            tracing::debug!(iterations, "model returned final answer");
            conversation.push(Message::assistant(text.clone()));
            send_event(ctx.events, AgentEvent::Reply { text: text.clone() });
            return Ok(LoopReport {
                reply: text,
                outcome: LoopOutcome::Completed,
                iterations,
                tool_results,
            });
        }

        if let Some(text) = reply.content.as_deref().filter(|t| !t.trim().is_empty()) {
            last_model_text = Some(text.to_string());
        }

        let mut round = Vec::with_capacity(reply.tool_calls.len() + 1);
        round.push(Message::assistant_tool_calls(reply.tool_calls.clone()));
        let mut tripped = false;

        for (idx, call) in reply.tool_calls.iter().enumerate() {
            if tripped {
                round.push(Message::tool(&call.id, &call.name, SKIPPED_TOOL_TEXT));
                continue;
            }

            send_event(
                ctx.events,
                AgentEvent::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            );
            let result = dispatch.dispatch(call, ctx.cancel).await;
            if ctx.cancel.is_cancelled() {
                round.push(result.to_message(call));
                for rest in &reply.tool_calls[idx + 1..] {
                    round.push(Message::tool(&rest.id, &rest.name, CANCELLED_TOOL_TEXT));
                }
                tracing::debug!(completed = idx + 1, "tool round cancelled");
                conversation.commit(round);
                return Err(AgentError::Cancelled);
            }
            send_event(
                ctx.events,
                AgentEvent::ToolCallEnd {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    success: result.success,
                    preview: preview(&result.result_text),
                },
            );

            round.push(result.to_message(call));
            if result.success {
                consecutive_failures = 0;
            } else {
                consecutive_failures += 1;
                tracing::debug!(tool = %call.name, consecutive_failures, "tool call failed");
                if consecutive_failures >= max_failures {
                    tripped = true;
                }
            }
            tool_results.push(result);
        }

        conversation.commit(round);

        if tripped {
            let summary = failure_summary(&tool_results, consecutive_failures);
            tracing::warn!(consecutive_failures, "tool loop circuit breaker tripped");
            conversation.push(Message::assistant(summary.clone()));
            send_event(ctx.events, AgentEvent::Reply { text: summary.clone() });
            return Ok(LoopReport {
                reply: summary,
                outcome: LoopOutcome::CircuitBroken,
                iterations,
                tool_results,
            });
        }
    }
}

/// 截断时的最佳文本：模型最近的非空文本，其次最近一次成功的工具结果，最后是固定说明；不返回空串
fn best_available_text(
    last_model_text: Option<&str>,
    results: &[ToolCallResult],
    iterations: usize,
) -> String {
    if let Some(t) = last_model_text {
        return t.to_string();
    }
    results
        .iter()
        .rev()
        .find(|r| r.success && !r.result_text.trim().is_empty())
        .map(|r| r.result_text.clone())
        .unwrap_or_else(|| {
            format!(
                "Stopped after {} iterations without a final answer.",
                iterations
            )
        })
}

fn failure_summary(results: &[ToolCallResult], failures: usize) -> String {
    let last = results
        .iter()
        .rev()
        .find(|r| !r.success)
        .map(|r| format!(" Last error from {}: {}", r.tool_name, r.result_text))
        .unwrap_or_default();
    format!(
        "Stopped after {} consecutive tool failures.{}",
        failures, last
    )
}

fn preview(text: &str) -> String {
    truncate_chars(text, PREVIEW_CHARS)
}
