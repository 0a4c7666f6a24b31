//! 能力路由
//!
//! 持有能力包快照（Arc 整体替换），负责：名称解析、斜杠命令识别、按需刷新目录。
//! 读取方拿到的是某一时刻的完整快照，刷新不会让进行中的请求看到半更新状态。

use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::capability::{Capability, CapabilityRegistry, CapabilitySource};

/// 解析出的斜杠命令：`/<name> [rest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub name: String,
    pub rest: String,
}

static SLASH_RE: OnceLock<Regex> = OnceLock::new();

pub struct CapabilityRouter {
    source: Arc<dyn CapabilitySource>,
    registry: RwLock<Arc<CapabilityRegistry>>,
}

impl CapabilityRouter {
    /// 以空快照创建；调用 refresh 后才有能力包
    pub fn new(source: Arc<dyn CapabilitySource>) -> Self {
        Self {
            source,
            registry: RwLock::new(Arc::new(CapabilityRegistry::default())),
        }
    }

    /// 创建并立即加载一次
    pub async fn load(source: Arc<dyn CapabilitySource>) -> anyhow::Result<Self> {
        let router = Self::new(source);
        router.refresh().await?;
        Ok(router)
    }

    /// 重新读取目录并整体替换快照，返回能力包数量
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let caps = self.source.load().await?;
        let registry = Arc::new(CapabilityRegistry::new(caps));
        let count = registry.len();
        {
            let mut guard = self.registry.write().unwrap_or_else(|e| e.into_inner());
            *guard = registry;
        }
        tracing::info!(count, "capability registry refreshed");
        Ok(count)
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<CapabilityRegistry> {
        let guard = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn resolve(&self, name: &str) -> Option<Capability> {
        self.snapshot().resolve(name).cloned()
    }

    /// 识别 `/<name> [rest]`；仅当 name 能解析为已注册能力包时返回 (能力包, 剩余文本)
    pub fn route_slash(&self, message: &str) -> Option<(Capability, String)> {
        let cmd = Self::parse_slash_command(message)?;
        let cap = self.resolve(&cmd.name)?;
        Some((cap, cmd.rest))
    }

    pub fn parse_slash_command(message: &str) -> Option<SlashCommand> {
        let re = SLASH_RE.get_or_init(|| Regex::new(r"(?s)^/([A-Za-z0-9_\-]+)(?:\s+(.*))?$").unwrap());
        let caps = re.captures(message.trim())?;
        let name = caps.get(1)?.as_str().to_string();
        let rest = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        Some(SlashCommand { name, rest })
    }
}

impl std::fmt::Debug for CapabilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRouter")
            .field("capabilities", &self.snapshot().ids())
            .finish()
    }
}
