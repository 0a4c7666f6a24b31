//! 能力包：一组命名的工具子集
//!
//! 能力包由目录发现（capability.toml）或进程内静态目录提供，组装为只读快照 CapabilityRegistry；
//! CapabilityRouter 持有当前快照，负责名称解析与 `/capability` 斜杠命令识别。

pub mod loader;
pub mod router;

use serde::{Deserialize, Serialize};

pub use loader::{CapabilityLoader, CapabilitySource, StaticCatalog};
pub use router::{CapabilityRouter, SlashCommand};

/// 能力包定义：id、一行描述、允许的工具名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// 目录加载时可省略，取子目录名
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "tools")]
    pub allowed_tools: Vec<String>,
}

impl Capability {
    pub fn new<I, S>(id: impl Into<String>, description: impl Into<String>, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            description: description.into(),
            allowed_tools: tools.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool)
    }

    /// 用于目录列表的单行摘要
    pub fn summary(&self) -> String {
        if self.description.is_empty() {
            self.id.clone()
        } else {
            format!("{}: {}", self.id, self.description)
        }
    }
}

/// 名称归一化：只保留字母数字并转小写（`data-basic` / `data_basic` / `DataBasic` 等价）
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// 能力包只读快照，按 id 排序
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<Capability>,
}

impl CapabilityRegistry {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let mut list: Vec<Capability> = Vec::new();
        for cap in capabilities {
            if cap.id.trim().is_empty() {
                tracing::warn!("capability without id skipped");
                continue;
            }
            if list.iter().any(|c| c.id == cap.id) {
                tracing::warn!(capability = %cap.id, "duplicate capability id, keeping first");
                continue;
            }
            list.push(cap);
        }
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Self { capabilities: list }
    }

    /// 先精确匹配 id，再做大小写与分隔符无关的匹配；多个归一化命中时取 id 序第一个
    pub fn resolve(&self, name: &str) -> Option<&Capability> {
        let name = name.trim();
        if let Some(c) = self.capabilities.iter().find(|c| c.id == name) {
            return Some(c);
        }
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        self.capabilities
            .iter()
            .find(|c| normalize_name(&c.id) == wanted)
    }

    pub fn get(&self, id: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// 目录摘要：每个能力包一行
    pub fn catalog_summary(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| format!("- {}", c.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
