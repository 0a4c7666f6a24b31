//! HTTP 接口（feature = "web"）
//!
//! 路由：
//! - POST /api/chat：一次性返回回复与路由元数据
//! - POST /api/chat/stream：NDJSON 流，首行 session_id，随后按循环顺序输出 AgentEvent
//! - DELETE /api/session/:id：删除会话（进行中的请求随之取消）
//! - GET /api/health：当前注册的工具名与能力包 id，供调用方校验兼容性
//! - GET /api/capabilities、POST /api/capabilities/reload
//!
//! 错误统一为 `{code, message}`，message 不含内部细节。

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capability::Capability;
use crate::core::AgentError;
use crate::react::AgentEvent;
use crate::session::{ChatResponse, SessionManager};

const RETRY_AFTER_SECS: &str = "5";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// 对外错误：状态码 + 稳定 code + 不泄露细节的 message
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        let status = match &e {
            AgentError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::Llm(_) => StatusCode::BAD_GATEWAY,
            AgentError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code().to_string(),
            message: e.public_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry = self.status == StatusCode::SERVICE_UNAVAILABLE;
        let mut res = (
            self.status,
            Json(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response();
        if retry {
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        res
    }
}

pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/session/:id", delete(api_delete_session))
        .route("/api/health", get(api_health))
        .route("/api/capabilities", get(api_capabilities))
        .route("/api/capabilities/reload", post(api_capabilities_reload))
        .with_state(AppState { manager })
}

fn validate(req: &ChatRequest) -> Result<(String, Option<String>), ApiError> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }
    let session_id = req.session_id.clone().filter(|s| !s.trim().is_empty());
    Ok((message, session_id))
}

async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let (message, session_id) = validate(&req)?;
    // 客户端断开时 handler future 被丢弃，guard 随之取消本次请求
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let resp = state
        .manager
        .chat(session_id.as_deref(), &message, &cancel, None)
        .await?;
    Ok(Json(resp))
}

/// 流式聊天：首行 `{"type":"session","session_id":...}`，之后每行一个 AgentEvent，以 done 或 error 结尾
async fn api_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let (message, session_id) = validate(&req)?;
    // 先完成准入，容量错误以普通 HTTP 错误返回而非流内事件
    let (session_id, _) = state
        .manager
        .resolve_or_create(session_id.as_deref())
        .await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let manager = Arc::clone(&state.manager);
    let sid = session_id.clone();
    tokio::spawn(async move {
        // 错误已作为 error 事件写入流
        let _ = manager.chat(Some(&sid), &message, &cancel, Some(&event_tx)).await;
    });

    let first_line = format!(
        "{}\n",
        serde_json::json!({"type": "session", "session_id": session_id})
    );
    // guard 随流一起存活；客户端断开丢弃流即取消循环
    let stream = stream::unfold(
        (event_rx, Some(first_line), guard),
        |(mut event_rx, first, guard)| async move {
            if let Some(line) = first {
                return Some((
                    Ok::<_, std::convert::Infallible>(Bytes::from(line)),
                    (event_rx, None, guard),
                ));
            }
            let ev = event_rx.recv().await?;
            let line = match serde_json::to_string(&ev) {
                Ok(json) => format!("{}\n", json),
                Err(e) => {
                    tracing::warn!("event serialization failed: {}", e);
                    return Some((Ok(Bytes::new()), (event_rx, None, guard)));
                }
            };
            Some((Ok(Bytes::from(line)), (event_rx, None, guard)))
        },
    );

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson; charset=utf-8"),
    );
    Ok(res)
}

async fn api_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.manager.delete(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AgentError::SessionNotFound(id).into())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tools: Vec<String>,
    capabilities: Vec<String>,
    sessions: usize,
}

async fn api_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let components = state.manager.components();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tools: components.tools.tool_names(),
        capabilities: components.router.snapshot().ids(),
        sessions: state.manager.len().await,
    })
}

async fn api_capabilities(State(state): State<AppState>) -> Json<Vec<Capability>> {
    let snapshot = state.manager.components().router.snapshot();
    Json(snapshot.iter().cloned().collect())
}

/// 重新加载能力包目录；进行中的请求继续使用旧快照，下一轮生效
async fn api_capabilities_reload(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.manager.components().router.refresh().await {
        Ok(count) => Ok(Json(serde_json::json!({ "capabilities": count }))),
        Err(e) => {
            tracing::warn!("capability reload failed: {:#}", e);
            Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "reload_failed".to_string(),
                message: "Capability reload failed".to_string(),
            })
        }
    }
}
