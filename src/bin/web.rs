//! Tally Web 服务：HTTP 聊天接口 + 后台会话回收
//!
//! 运行：cargo run --bin tally-web --features web
//! 端口：配置 [web].port，或环境变量 TALLY_WEB_PORT 覆盖

use std::sync::Arc;

use anyhow::Context;
use tally::core::create_agent_builder;
use tally::{observability, web, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let components = create_agent_builder(None).build_components().await;
    let cfg = components.config.clone();
    let manager = Arc::new(SessionManager::new(components, cfg.session.clone()));
    let _sweeper = manager.spawn_sweeper();

    let app = web::router(Arc::clone(&manager));

    let port = std::env::var("TALLY_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.web.port);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(capacity = manager.capacity(), "Tally web: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
