//! 能力包发现
//!
//! CapabilityLoader 从目录加载：每个子目录 `<dir>/<id>/capability.toml` 定义一个能力包；
//! StaticCatalog 为进程内固定目录（测试与嵌入使用）。

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::capability::Capability;

/// 能力包来源：按需读取完整目录
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<Capability>>;
}

/// 进程内静态目录
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    capabilities: Vec<Capability>,
}

impl StaticCatalog {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CapabilitySource for StaticCatalog {
    async fn load(&self) -> anyhow::Result<Vec<Capability>> {
        Ok(self.capabilities.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CapabilityToml {
    capability: Capability,
}

/// 目录加载器
#[derive(Debug, Clone)]
pub struct CapabilityLoader {
    dir: PathBuf,
}

impl CapabilityLoader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// 从默认位置创建
    pub fn from_default() -> Self {
        let dirs = [
            PathBuf::from("config/capabilities"),
            PathBuf::from("../config/capabilities"),
        ];
        let dir = dirs
            .into_iter()
            .find(|d| d.exists())
            .unwrap_or_else(|| PathBuf::from("config/capabilities"));
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_sync(dir: &Path) -> anyhow::Result<Vec<Capability>> {
        let mut caps = Vec::new();
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "capabilities dir not found");
            return Ok(caps);
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading capabilities dir {}", dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match Self::load_one(&path) {
                Ok(Some(cap)) => caps.push(cap),
                Ok(None) => {}
                // 单个能力包损坏不影响其余
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skip capability"),
            }
        }
        Ok(caps)
    }

    fn load_one(dir: &Path) -> anyhow::Result<Option<Capability>> {
        let file = dir.join("capability.toml");
        if !file.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        let parsed: CapabilityToml =
            toml::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
        let mut cap = parsed.capability;
        if cap.id.trim().is_empty() {
            if let Some(name) = dir.file_name() {
                cap.id = name.to_string_lossy().to_string();
            }
        }
        Ok(Some(cap))
    }
}

#[async_trait]
impl CapabilitySource for CapabilityLoader {
    async fn load(&self) -> anyhow::Result<Vec<Capability>> {
        let dir = self.dir.clone();
        let caps = tokio::task::spawn_blocking(move || Self::load_sync(&dir))
            .await
            .context("capability loader task failed")??;
        tracing::info!(count = caps.len(), dir = %self.dir.display(), "Loaded capabilities");
        Ok(caps)
    }
}
