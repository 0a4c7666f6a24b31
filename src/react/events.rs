//! 循环过程事件：用于 NDJSON 流式展示思考、工具调用与回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 正在调用模型（第几轮）
    Thinking {
        iteration: usize,
        max_iterations: usize,
    },
    /// 开始执行一次工具调用
    ToolCallStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// 工具调用结束（结果预览，避免过长）
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
        preview: String,
    },
    /// 最终回复
    Reply { text: String },
    /// 本轮请求结束，附带元数据
    Done {
        session_id: String,
        capabilities_used: Vec<String>,
        tool_scope: Vec<String>,
        scope_state: String,
        route_mode: String,
        truncated: bool,
        circuit_broken: bool,
        iterations: usize,
    },
    /// 错误（code 为稳定标识）
    Error { code: String, message: String },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<AgentEvent>;

pub(crate) fn send_event(tx: Option<&EventSender>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let v = serde_json::to_value(AgentEvent::ToolCallEnd {
            id: "c1".into(),
            name: "echo".into(),
            success: true,
            preview: "hi".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "tool_call_end");
        assert_eq!(v["success"], true);

        let v = serde_json::to_value(AgentEvent::Reply { text: "ok".into() }).unwrap();
        assert_eq!(v["type"], "reply");
    }
}
