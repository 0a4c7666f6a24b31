//! 运行时集成测试：经由 SessionManager 的公开接口驱动完整一轮

use std::sync::Arc;

use serde_json::json;
use tally::capability::{Capability, StaticCatalog};
use tally::config::{AppConfig, SessionSection};
use tally::core::AgentBuilder;
use tally::llm::{LlmReply, ScriptedLlmClient};
use tally::memory::ToolCall;
use tally::react::{AgentEvent, ACTIVATE_CAPABILITY, DELEGATE_TASK};
use tally::tools::{EchoTool, FnTool, ToolRegistry};
use tally::{RouteMode, SessionManager};
use tokio_util::sync::CancellationToken;

fn registry() -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool);
    reg.register(FnTool::new("read_sheet", "Read a cell", |args| {
        Ok(format!("value of {}", args["cell"].as_str().unwrap_or("?")))
    }));
    reg.register(FnTool::new("write_sheet", "Write a cell", |_| Ok("written".into())).mutating());
    reg.register(FnTool::new("flaky", "Always fails", |_| Err("disk unavailable".into())));
    reg
}

async fn manager(llm: Arc<ScriptedLlmClient>) -> Arc<SessionManager> {
    let mut config = AppConfig::default();
    config.tools.write_tools = vec!["write_sheet".into()];
    let catalog = StaticCatalog::new([
        Capability::new("data-basic", "Tables", ["read_sheet", "write_sheet", DELEGATE_TASK]),
        Capability::new("ops", "Operations", ["flaky"]),
    ]);
    let components = AgentBuilder::new(config, std::env::temp_dir())
        .with_llm(llm)
        .with_tools(registry())
        .with_capability_source(Arc::new(catalog))
        .build_components()
        .await;
    Arc::new(SessionManager::new(components, SessionSection::default()))
}

fn data_basic_scope() -> Vec<String> {
    ["read_sheet", "write_sheet", ACTIVATE_CAPABILITY, DELEGATE_TASK]
        .map(String::from)
        .to_vec()
}

#[tokio::test]
async fn test_slash_and_meta_tool_reach_same_scope() {
    let llm = Arc::new(ScriptedLlmClient::new([
        LlmReply::tool_calls(vec![ToolCall::new(
            "a1",
            ACTIVATE_CAPABILITY,
            json!({"capability": "Data_Basic"}),
        )]),
        LlmReply::text("ready"),
    ]));
    let mgr = manager(llm.clone()).await;
    let cancel = CancellationToken::new();

    let direct = mgr.chat(Some("slash"), "/data-basic", &cancel, None).await.unwrap();
    assert_eq!(direct.scope_state, "capability:data-basic");
    assert_eq!(direct.tool_scope, data_basic_scope());
    assert_eq!(direct.route_mode, RouteMode::Direct);
    assert_eq!(llm.call_count(), 0);

    let via_tool = mgr.chat(Some("meta"), "work on tables", &cancel, None).await.unwrap();
    assert_eq!(via_tool.scope_state, "capability:data-basic");
    assert_eq!(via_tool.tool_scope, data_basic_scope());
    assert_eq!(via_tool.route_mode, RouteMode::Active);
    assert_eq!(via_tool.capabilities_used, vec!["data-basic"]);
    assert_eq!(via_tool.reply, "ready");

    // 激活后的第二次模型调用只看到该能力包的工具
    let second = &llm.requests()[1];
    assert!(second.tool_names.contains(&"read_sheet".to_string()));
    assert!(!second.tool_names.contains(&"echo".to_string()));
}

#[tokio::test]
async fn test_read_only_delegation_excludes_write_tools() {
    let llm = Arc::new(ScriptedLlmClient::new([
        LlmReply::tool_calls(vec![ToolCall::new(
            "d1",
            DELEGATE_TASK,
            json!({"task": "read A1", "read_only": true}),
        )]),
        LlmReply::tool_calls(vec![ToolCall::new("s1", "read_sheet", json!({"cell": "A1"}))]),
        LlmReply::text("A1 holds a value"),
        LlmReply::text("Done: A1 holds a value"),
    ]));
    let mgr = manager(llm.clone()).await;
    let cancel = CancellationToken::new();

    mgr.chat(Some("s"), "/data-basic", &cancel, None).await.unwrap();
    let resp = mgr.chat(Some("s"), "what is in A1?", &cancel, None).await.unwrap();
    assert_eq!(resp.reply, "Done: A1 holds a value");
    assert_eq!(resp.scope_state, "capability:data-basic");
    assert_eq!(resp.tool_scope, data_basic_scope());

    let requests = llm.requests();
    assert_eq!(requests.len(), 4);
    let sub_tools = &requests[1].tool_names;
    assert_eq!(sub_tools, &vec!["read_sheet".to_string()]);
    assert_eq!(requests[1].messages[1].text(), "read A1");
}

#[tokio::test]
async fn test_circuit_breaker_end_to_end() {
    let flaky = || ToolCall::new("f", "flaky", json!({}));
    let llm = Arc::new(ScriptedLlmClient::default().with_fallback(LlmReply::tool_calls(vec![flaky()])));
    let mgr = manager(llm.clone()).await;
    let cancel = CancellationToken::new();

    mgr.chat(Some("ops"), "/ops", &cancel, None).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let resp = mgr.chat(Some("ops"), "run it", &cancel, Some(&tx)).await.unwrap();
    drop(tx);

    assert!(resp.circuit_broken);
    assert!(!resp.truncated);
    assert_eq!(llm.call_count(), 3);
    assert!(resp.reply.contains("disk unavailable"));

    let mut failures = 0;
    let mut done = false;
    while let Some(ev) = rx.recv().await {
        match ev {
            AgentEvent::ToolCallEnd { success: false, .. } => failures += 1,
            AgentEvent::Done { circuit_broken, .. } => done = circuit_broken,
            _ => {}
        }
    }
    assert_eq!(failures, 3);
    assert!(done);
}

#[tokio::test]
async fn test_sessions_keep_separate_histories() {
    let llm = Arc::new(ScriptedLlmClient::default().with_fallback(LlmReply::text("ok")));
    let mgr = manager(llm.clone()).await;
    let cancel = CancellationToken::new();

    mgr.chat(Some("a"), "first for a", &cancel, None).await.unwrap();
    mgr.chat(Some("a"), "second for a", &cancel, None).await.unwrap();
    mgr.chat(Some("b"), "first for b", &cancel, None).await.unwrap();

    let requests = llm.requests();
    // system + user + assistant + user
    assert_eq!(requests[1].messages.len(), 4);
    // b 只看到自己的 system + user
    assert_eq!(requests[2].messages.len(), 2);
    assert_eq!(requests[2].messages[1].text(), "first for b");
    assert_eq!(mgr.session_ids().await, vec!["a", "b"]);
}
