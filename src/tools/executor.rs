//! 工具执行器
//!
//! 对每次调用施加超时，异步工具在当前任务内执行并捕获 panic，阻塞工具经 TaskScheduler 放入有界工作池；
//! 所有失败都收敛为 ToolCallResult{success=false}，不会越过循环边界。每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, TaskScheduler};
use crate::memory::{Message, ToolCall};
use crate::tools::{Tool, ToolKind, ToolView};

/// 一次工具调用的结果，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub arguments: Value,
    pub result_text: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(call: &ToolCall, result_text: impl Into<String>) -> Self {
        Self {
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result_text: result_text.into(),
            success: true,
            error: None,
        }
    }

    /// 失败结果：result_text 即回灌给模型的错误描述
    pub fn failed(call: &ToolCall, err: &AgentError) -> Self {
        Self {
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result_text: format!("Error: {}", err),
            success: false,
            error: Some(err.to_string()),
        }
    }

    /// 转为回复 call.id 的 tool 消息
    pub fn to_message(&self, call: &ToolCall) -> Message {
        Message::tool(&call.id, &call.name, &self.result_text)
    }
}

/// 工具执行器：持有超时与阻塞工作池
pub struct ToolExecutor {
    scheduler: TaskScheduler,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(scheduler: TaskScheduler, timeout_secs: u64) -> Self {
        Self {
            scheduler,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 在 view 范围内执行一次调用；不在视图内、失败、超时、panic、取消都返回失败结果
    pub async fn invoke(
        &self,
        view: &ToolView,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        let Some(tool) = view.get(&call.name) else {
            tracing::warn!(tool = %call.name, "tool not in current view");
            return ToolCallResult::failed(call, &AgentError::ToolNotAvailable(call.name.clone()));
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = self.execute(tool, call.arguments.clone()) => r,
        };

        match outcome {
            Ok(text) => ToolCallResult::ok(call, text),
            Err(e) => ToolCallResult::failed(call, &e),
        }
    }

    /// 执行指定工具；超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed；输出 JSON 审计日志
    pub async fn execute(&self, tool: Arc<dyn Tool>, args: Value) -> Result<String, AgentError> {
        let start = Instant::now();
        let tool_name = tool.name().to_string();
        let args_preview = args_preview(&args);

        let result = match tool.kind() {
            ToolKind::Async => {
                let fut = AssertUnwindSafe(async move { tool.execute(args).await }).catch_unwind();
                match timeout(self.timeout, fut).await {
                    Ok(Ok(r)) => r.map_err(AgentError::ToolExecutionFailed),
                    Ok(Err(_)) => Err(AgentError::ToolPanicked(tool_name.clone())),
                    Err(_) => Err(AgentError::ToolTimeout(tool_name.clone())),
                }
            }
            ToolKind::Blocking => {
                let job = self
                    .scheduler
                    .run_blocking(move || tool.execute_blocking(args));
                match timeout(self.timeout, job).await {
                    Ok(Ok(r)) => r.map_err(AgentError::ToolExecutionFailed),
                    Ok(Err(AgentError::ToolPanicked(_))) => {
                        Err(AgentError::ToolPanicked(tool_name.clone()))
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AgentError::ToolTimeout(tool_name.clone())),
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AgentError::ToolTimeout(_)) => "timeout",
            Err(AgentError::ToolPanicked(_)) => "panic",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FnTool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }

        fn description(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            panic!("tool bug");
        }
    }

    fn view() -> ToolView {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(SlowTool);
        reg.register(PanickyTool);
        reg.register(FnTool::new("fails", "always fails", |_| Err("bad input".into())));
        reg.register(
            FnTool::new("sum", "blocking sum", |args| {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok((a + b).to_string())
            })
            .blocking(),
        );
        ToolView::all(Arc::new(reg))
    }

    fn executor() -> ToolExecutor {
        ToolExecutor::new(TaskScheduler::new(2), 5).with_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let call = ToolCall::new("c1", "echo", json!({"text": "hi"}));
        let r = executor().invoke(&view(), &call, &CancellationToken::new()).await;
        assert!(r.success);
        assert_eq!(r.result_text, "hi");
        assert_eq!(r.to_message(&call).tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_invoke_failure_is_contained() {
        let call = ToolCall::new("c1", "fails", json!({}));
        let r = executor().invoke(&view(), &call, &CancellationToken::new()).await;
        assert!(!r.success);
        assert!(r.result_text.contains("bad input"));
        assert!(r.error.is_some());
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let call = ToolCall::new("c1", "slow", json!({}));
        let r = executor().invoke(&view(), &call, &CancellationToken::new()).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_invoke_panic_is_contained() {
        let call = ToolCall::new("c1", "panicky", json!({}));
        let r = executor().invoke(&view(), &call, &CancellationToken::new()).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_invoke_blocking_tool() {
        let call = ToolCall::new("c1", "sum", json!({"a": 2, "b": 3}));
        let r = executor().invoke(&view(), &call, &CancellationToken::new()).await;
        assert!(r.success);
        assert_eq!(r.result_text, "5");
    }

    #[tokio::test]
    async fn test_invoke_outside_view() {
        let narrowed = view().without(["echo"]);
        let call = ToolCall::new("c1", "echo", json!({"text": "hi"}));
        let r = executor().invoke(&narrowed, &call, &CancellationToken::new()).await;
        assert!(!r.success);
        assert!(r.result_text.contains("not available"));
    }

    #[tokio::test]
    async fn test_invoke_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let call = ToolCall::new("c1", "slow", json!({}));
        let r = ToolExecutor::new(TaskScheduler::new(1), 30)
            .invoke(&view(), &call, &token)
            .await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Cancelled"));
    }
}
