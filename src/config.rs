//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TALLY__*` 覆盖（双下划线表示嵌套，如 `TALLY__SESSION__CAPACITY=8`）。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub subagent: SubagentSection,
    pub session: SessionSection,
    pub tools: ToolsSection,
    pub web: WebSection,
}

/// [app] 段：应用名、系统提示词、能力包目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 主循环系统提示词；未设置时用内置默认值
    pub system_prompt: Option<String>,
    /// 能力包目录，未设置时依次查找 config/capabilities、../config/capabilities
    pub capabilities_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；openai 需 OPENAI_API_KEY，否则回退 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agent] 段：主循环轮数上限、连续失败熔断阈值、上下文 token 预算
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
    /// 超出时从头部裁剪旧轮次；0 表示不裁剪
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_consecutive_failures: default_max_consecutive_failures(),
            context_token_budget: default_context_token_budget(),
        }
    }
}

fn default_max_iterations() -> usize {
    20
}

fn default_max_consecutive_failures() -> usize {
    3
}

fn default_context_token_budget() -> usize {
    16_000
}

/// [subagent] 段：子智能体独立的轮数与熔断预算、摘要长度上限
#[derive(Debug, Clone, Deserialize)]
pub struct SubagentSection {
    #[serde(default = "default_subagent_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_subagent_max_failures")]
    pub max_consecutive_failures: usize,
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,
    pub system_prompt: Option<String>,
}

impl Default for SubagentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_subagent_max_iterations(),
            max_consecutive_failures: default_subagent_max_failures(),
            max_summary_chars: default_max_summary_chars(),
            system_prompt: None,
        }
    }
}

fn default_subagent_max_iterations() -> usize {
    8
}

fn default_subagent_max_failures() -> usize {
    2
}

fn default_max_summary_chars() -> usize {
    4000
}

/// [session] 段：会话池容量、空闲过期与清扫周期
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 满容量时是否淘汰最久未活跃的空闲会话（默认直接拒绝）
    #[serde(default)]
    pub evict_idle_on_capacity: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            evict_idle_on_capacity: false,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_capacity() -> usize {
    64
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// [tools] 段：工具超时、阻塞工具池大小、工作目录、写工具名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 同时运行的阻塞工具上限（spawn_blocking 许可数）
    #[serde(default = "default_max_blocking_tools")]
    pub max_blocking_tools: usize,
    /// 文件工具的沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 具有写副作用的工具名；只读委派时从子智能体视图中剔除
    #[serde(default = "default_write_tools")]
    pub write_tools: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_blocking_tools: default_max_blocking_tools(),
            workspace_root: None,
            write_tools: default_write_tools(),
        }
    }
}

impl ToolsSection {
    pub fn write_tool_set(&self) -> BTreeSet<String> {
        self.write_tools.iter().cloned().collect()
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_blocking_tools() -> usize {
    4
}

fn default_write_tools() -> Vec<String> {
    vec!["write_file".into()]
}

/// [web] 段：监听端口
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

/// 从 config 目录加载配置，环境变量 TALLY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TALLY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TALLY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.agent.max_consecutive_failures, 3);
        assert_eq!(cfg.session.capacity, 64);
        assert!(cfg.tools.write_tool_set().contains("write_file"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[session]\ncapacity = 2\nttl_secs = 5\n\n[agent]\nmax_iterations = 7\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.session.capacity, 2);
        assert_eq!(cfg.session.ttl(), Duration::from_secs(5));
        assert_eq!(cfg.agent.max_iterations, 7);
        // 未出现的段落使用默认值
        assert_eq!(cfg.subagent.max_iterations, 8);
    }
}
