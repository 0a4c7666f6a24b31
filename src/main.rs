//! Tally 命令行入口
//!
//! 单会话 REPL：每行一条消息；`/new` 开启新会话，`/scope` 查看当前作用域与可见工具，
//! `/quit` 退出；其它 `/capability` 前缀原样交给引擎路由。Ctrl-C 取消正在进行的请求。

use std::sync::Arc;

use anyhow::Context;
use tally::core::create_agent_builder;
use tally::observability;
use tally::react::AgentEvent;
use tally::SessionManager;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn new_session_id() -> String {
    format!("cli-{}", uuid::Uuid::new_v4())
}

/// 工具调用过程打印到 stderr，回复正文由主循环输出到 stdout
async fn print_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            AgentEvent::ToolCallStart { name, arguments, .. } => {
                eprintln!("  → {} {}", name, arguments);
            }
            AgentEvent::ToolCallEnd {
                name,
                success,
                preview,
                ..
            } => {
                let mark = if success { "✓" } else { "✗" };
                eprintln!("  {} {}: {}", mark, name, preview);
            }
            AgentEvent::Error { code, message } => eprintln!("  [{}] {}", code, message),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let components = create_agent_builder(None).build_components().await;
    let session_config = components.config.session.clone();
    let manager = Arc::new(SessionManager::new(components, session_config));

    let mut session_id = new_session_id();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Tally agent. /new 新会话, /scope 当前作用域, /quit 退出");
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/new" => {
                manager.delete(&session_id).await;
                session_id = new_session_id();
                println!("(new session {})", session_id);
                continue;
            }
            "/scope" => {
                let (_, session) = manager
                    .resolve_or_create(Some(&session_id))
                    .await
                    .context("Failed to open session")?;
                let engine = session.engine().await;
                println!(
                    "scope: {}\ntools: {}",
                    engine.scope().label(),
                    engine.visible_tool_names().join(", ")
                );
                continue;
            }
            _ => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_events(rx));
        let cancel = CancellationToken::new();
        let result = tokio::select! {
            r = manager.chat(Some(&session_id), input, &cancel, Some(&tx)) => Some(r),
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                None
            }
        };
        drop(tx);
        let _ = printer.await;

        match result {
            Some(Ok(resp)) => {
                println!("{}", resp.reply);
                if resp.truncated || resp.circuit_broken {
                    println!(
                        "(stopped early: truncated={}, circuit_broken={})",
                        resp.truncated, resp.circuit_broken
                    );
                }
            }
            Some(Err(e)) => tracing::warn!(code = e.code(), "request failed: {}", e),
            None => println!("(cancelled)"),
        }
    }

    Ok(())
}
