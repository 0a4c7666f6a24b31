//! 会话管理
//!
//! 每个会话 ID 对应一个独占的 AgentEngine。查找走读锁；创建在写锁下二次检查，保证一个 ID 只有一个引擎，
//! 且池大小永不超过容量。后台清扫任务按固定周期移除空闲超过 TTL 的会话，有请求在途的会话不会被清扫。
//! 删除会话会取消其在途请求，该请求在下一个挂起点退出并报告 session_not_found。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEngine, RouteMode, TurnOutcome};
use crate::config::SessionSection;
use crate::core::{AgentComponents, AgentError};
use crate::react::events::{send_event, AgentEvent, EventSender};

/// 单个会话：引擎由会话自己的互斥锁串行化访问
pub struct Session {
    pub id: String,
    engine: tokio::sync::Mutex<AgentEngine>,
    pub created_at: DateTime<Utc>,
    last_active: Mutex<Instant>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    fn new(id: String, components: Arc<AgentComponents>) -> Self {
        Self {
            engine: tokio::sync::Mutex::new(AgentEngine::new(id.clone(), components)),
            id,
            created_at: Utc::now(),
            last_active: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    /// 是否有请求在途
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 引擎锁（同一会话的请求排队执行）
    pub async fn engine(&self) -> tokio::sync::MutexGuard<'_, AgentEngine> {
        self.engine.lock().await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

/// 在途请求凭证：持有期间会话不会被清扫，释放时刷新 last_active
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    fn new(session: Arc<Session>) -> Self {
        session.in_flight.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::ops::Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// /api/chat 的响应体
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
    pub capabilities_used: Vec<String>,
    /// 回合结束时模型可见的工具名
    pub tool_scope: Vec<String>,
    pub scope_state: String,
    pub route_mode: RouteMode,
    pub truncated: bool,
    pub circuit_broken: bool,
    pub iterations: usize,
}

impl ChatResponse {
    fn new(session_id: String, turn: TurnOutcome) -> Self {
        Self {
            session_id,
            truncated: turn.truncated(),
            circuit_broken: turn.circuit_broken(),
            reply: turn.reply,
            capabilities_used: turn.capabilities_used,
            tool_scope: turn.tool_scope,
            scope_state: turn.scope_state,
            route_mode: turn.route_mode,
            iterations: turn.iterations,
        }
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    components: Arc<AgentComponents>,
    config: SessionSection,
}

impl SessionManager {
    pub fn new(components: Arc<AgentComponents>, config: SessionSection) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            components,
            config,
        }
    }

    pub fn components(&self) -> &Arc<AgentComponents> {
        &self.components
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 已存在的 ID 返回同一会话（刷新 last_active）；否则在容量内新建（给定 ID 则沿用，否则生成 UUID）
    pub async fn resolve_or_create(
        &self,
        session_id: Option<&str>,
    ) -> Result<(String, Arc<Session>), AgentError> {
        let lease = self.acquire(session_id).await?;
        let session = Arc::clone(lease.session());
        Ok((session.id.clone(), session))
    }

    /// 解析或创建会话并登记一个在途请求。计数在持锁期间完成，清扫任务不会移除刚取得的会话。
    pub async fn acquire(&self, session_id: Option<&str>) -> Result<SessionLease, AgentError> {
        let session_id = session_id.map(str::trim).filter(|s| !s.is_empty());

        if let Some(id) = session_id {
            let sessions = self.sessions.read().await;
            if let Some(s) = sessions.get(id) {
                return Ok(SessionLease::new(Arc::clone(s)));
            }
        }

        let mut sessions = self.sessions.write().await;
        // 等待写锁期间可能已被其他请求创建
        if let Some(id) = session_id {
            if let Some(s) = sessions.get(id) {
                return Ok(SessionLease::new(Arc::clone(s)));
            }
        }

        if sessions.len() >= self.config.capacity {
            let evicted = self.config.evict_idle_on_capacity && evict_lru_idle(&mut sessions);
            if !evicted {
                tracing::warn!(capacity = self.config.capacity, "session capacity exceeded");
                return Err(AgentError::CapacityExceeded {
                    capacity: self.config.capacity,
                });
            }
        }

        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = Arc::new(Session::new(id.clone(), Arc::clone(&self.components)));
        let lease = SessionLease::new(Arc::clone(&session));
        sessions.insert(id.clone(), session);
        tracing::info!(session_id = %id, active = sessions.len(), "session created");
        Ok(lease)
    }

    /// 删除会话并取消其在途请求；不存在时返回 false
    pub async fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(s) => {
                s.close();
                tracing::info!(session_id = %session_id, "session deleted");
                true
            }
            None => false,
        }
    }

    /// 移除空闲超过 TTL 且无在途请求的会话，返回移除数量
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let ttl = self.config.ttl();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            let expired = !s.is_busy() && s.idle_for(now) > ttl;
            if expired {
                s.close();
            }
            !expired
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(removed, remaining = sessions.len(), "expired sessions swept");
        }
        removed
    }

    /// 后台清扫任务：固定周期运行，与请求流量无关；管理器被释放后自动退出
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep_expired(Instant::now()).await;
            }
            tracing::debug!("session sweeper stopped");
        })
    }

    /// 处理一条消息：解析会话 -> 串行获取引擎 -> 跑循环。调用方的 cancel 与会话删除都会中止本次请求。
    pub async fn chat(
        &self,
        session_id: Option<&str>,
        message: &str,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<ChatResponse, AgentError> {
        let result = self.chat_inner(session_id, message, cancel, events).await;
        match &result {
            Ok(resp) => send_event(
                events,
                AgentEvent::Done {
                    session_id: resp.session_id.clone(),
                    capabilities_used: resp.capabilities_used.clone(),
                    tool_scope: resp.tool_scope.clone(),
                    scope_state: resp.scope_state.clone(),
                    route_mode: resp.route_mode.as_str().to_string(),
                    truncated: resp.truncated,
                    circuit_broken: resp.circuit_broken,
                    iterations: resp.iterations,
                },
            ),
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "chat request failed");
                send_event(
                    events,
                    AgentEvent::Error {
                        code: e.code().to_string(),
                        message: e.public_message(),
                    },
                );
            }
        }
        result
    }

    async fn chat_inner(
        &self,
        session_id: Option<&str>,
        message: &str,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<ChatResponse, AgentError> {
        let lease = self.acquire(session_id).await?;
        let id = lease.id.clone();

        // 会话删除（父令牌）或调用方取消都会触发本次请求的令牌
        let turn_cancel = lease.cancel.child_token();
        let forward = {
            let caller = cancel.clone();
            let turn = turn_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => turn.cancel(),
                    _ = turn.cancelled() => {}
                }
            })
        };

        let result = async {
            let mut engine = tokio::select! {
                biased;
                _ = turn_cancel.cancelled() => return Err(AgentError::Cancelled),
                guard = lease.engine() => guard,
            };
            engine.handle_message(message, &turn_cancel, events).await
        }
        .await;
        forward.abort();

        match result {
            Ok(turn) => Ok(ChatResponse::new(id, turn)),
            Err(AgentError::Cancelled) if lease.is_closed() => Err(AgentError::SessionNotFound(id)),
            Err(e) => Err(e),
        }
    }
}

/// 淘汰最久未活跃的空闲会话
fn evict_lru_idle(sessions: &mut HashMap<String, Arc<Session>>) -> bool {
    let victim = sessions
        .values()
        .filter(|s| !s.is_busy())
        .min_by_key(|s| s.last_active())
        .map(|s| s.id.clone());
    match victim.and_then(|id| sessions.remove(&id)) {
        Some(s) => {
            s.close();
            tracing::info!(session_id = %s.id, "idle session evicted at capacity");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::AgentBuilder;
    use crate::llm::{LlmReply, ScriptedLlmClient};
    use crate::capability::StaticCatalog;

    async fn manager_with(llm: ScriptedLlmClient, session: SessionSection) -> Arc<SessionManager> {
        let components = AgentBuilder::new(AppConfig::default(), std::env::temp_dir())
            .with_llm(Arc::new(llm))
            .with_capability_source(Arc::new(StaticCatalog::default()))
            .build_components()
            .await;
        Arc::new(SessionManager::new(components, session))
    }

    fn section(capacity: usize) -> SessionSection {
        SessionSection {
            capacity,
            ..SessionSection::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_identity_and_distinct_engines() {
        let mgr = manager_with(ScriptedLlmClient::default(), section(8)).await;

        let (a, sa) = mgr.resolve_or_create(Some("alice")).await.unwrap();
        let (a2, sa2) = mgr.resolve_or_create(Some("alice")).await.unwrap();
        let (b, sb) = mgr.resolve_or_create(None).await.unwrap();

        assert_eq!(a, "alice");
        assert_eq!(a2, "alice");
        assert!(Arc::ptr_eq(&sa, &sa2));
        assert!(!Arc::ptr_eq(&sa, &sb));
        assert!(uuid::Uuid::parse_str(&b).is_ok());
        assert_eq!(mgr.len().await, 2);
        assert!(!sa.is_busy());
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded_under_concurrency() {
        let mgr = manager_with(ScriptedLlmClient::default(), section(5)).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.resolve_or_create(Some(&format!("user-{}", i))).await
            }));
        }
        let mut ok = 0;
        let mut rejected = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AgentError::CapacityExceeded { capacity }) => {
                    assert_eq!(capacity, 5);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 5);
        assert_eq!(rejected, 15);
        assert_eq!(mgr.len().await, 5);
    }

    #[tokio::test]
    async fn test_capacity_holds_for_concurrent_anonymous_creates() {
        let mgr = manager_with(ScriptedLlmClient::default(), section(5)).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move { mgr.resolve_or_create(None).await }));
        }
        let mut ids = Vec::new();
        let mut rejected = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok((id, _)) => ids.push(id),
                Err(AgentError::CapacityExceeded { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ids.len(), 5);
        assert_eq!(rejected, 15);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert_eq!(mgr.len().await, 5);
    }

    #[tokio::test]
    async fn test_same_id_concurrently_gets_one_engine() {
        let mgr = manager_with(ScriptedLlmClient::default(), section(8)).await;
        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.resolve_or_create(Some("shared")).await.unwrap().1
            }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(mgr.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let mgr = manager_with(ScriptedLlmClient::default(), section(8)).await;
        mgr.resolve_or_create(Some("x")).await.unwrap();
        assert!(mgr.delete("x").await);
        assert!(!mgr.delete("x").await);
        assert!(!mgr.contains("x").await);
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_sessions() {
        let session = SessionSection {
            ttl_secs: 1,
            ..section(8)
        };
        let mgr = manager_with(ScriptedLlmClient::default(), session).await;
        mgr.resolve_or_create(Some("idle")).await.unwrap();
        let lease = mgr.acquire(Some("busy")).await.unwrap();

        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(mgr.sweep_expired(Instant::now()).await, 0);
        assert_eq!(mgr.sweep_expired(later).await, 1);
        assert_eq!(mgr.session_ids().await, vec!["busy"]);

        drop(lease);
        assert_eq!(mgr.sweep_expired(later + Duration::from_secs(5)).await, 1);
        assert!(mgr.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_removes_idle_sessions() {
        let session = SessionSection {
            ttl_secs: 2,
            sweep_interval_secs: 1,
            ..section(8)
        };
        let mgr = manager_with(ScriptedLlmClient::default(), session).await;
        mgr.resolve_or_create(Some("idle")).await.unwrap();
        let lease = mgr.acquire(Some("leased")).await.unwrap();
        let sweeper = mgr.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mgr.len().await, 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mgr.session_ids().await, vec!["leased"]);
        assert!(!lease.is_closed());

        sweeper.abort();
    }

    #[tokio::test]
    async fn test_eviction_is_opt_in() {
        let mgr = manager_with(ScriptedLlmClient::default(), section(1)).await;
        mgr.resolve_or_create(Some("a")).await.unwrap();
        assert!(matches!(
            mgr.resolve_or_create(Some("b")).await,
            Err(AgentError::CapacityExceeded { .. })
        ));

        let evicting = SessionSection {
            evict_idle_on_capacity: true,
            ..section(1)
        };
        let mgr = manager_with(ScriptedLlmClient::default(), evicting).await;
        mgr.resolve_or_create(Some("a")).await.unwrap();
        mgr.resolve_or_create(Some("b")).await.unwrap();
        assert_eq!(mgr.session_ids().await, vec!["b"]);

        // 唯一的会话在忙时不淘汰
        let _lease = mgr.acquire(Some("b")).await.unwrap();
        assert!(mgr.resolve_or_create(Some("c")).await.is_err());
    }

    #[tokio::test]
    async fn test_chat_returns_metadata() {
        let mgr = manager_with(ScriptedLlmClient::new([LlmReply::text("hi there")]), section(4)).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let resp = mgr
            .chat(Some("s"), "hello", &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();
        assert_eq!(resp.session_id, "s");
        assert_eq!(resp.reply, "hi there");
        assert_eq!(resp.route_mode, RouteMode::Catalog);
        assert!(!resp.truncated && !resp.circuit_broken);

        drop(tx);
        let mut last = None;
        while let Some(ev) = rx.recv().await {
            last = Some(ev);
        }
        assert!(matches!(last, Some(AgentEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_delete_cancels_in_flight_request() {
        let llm = ScriptedLlmClient::new([LlmReply::text("too late")])
            .with_delay(Duration::from_millis(500));
        let mgr = manager_with(llm, section(4)).await;
        mgr.resolve_or_create(Some("doomed")).await.unwrap();

        let task = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.chat(Some("doomed"), "work", &CancellationToken::new(), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mgr.delete("doomed").await);

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "session_not_found");
    }

    #[tokio::test]
    async fn test_caller_cancel_stops_request() {
        let llm = ScriptedLlmClient::new([LlmReply::text("too late")])
            .with_delay(Duration::from_millis(500));
        let mgr = manager_with(llm, section(4)).await;
        let cancel = CancellationToken::new();

        let task = {
            let mgr = Arc::clone(&mgr);
            let cancel = cancel.clone();
            tokio::spawn(async move { mgr.chat(Some("c"), "work", &cancel, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(mgr.contains("c").await);
    }
}
