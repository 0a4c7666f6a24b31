//! Agent 构建器：统一的组件初始化逻辑
//!
//! CLI 与 Web 共用同一套工具注册表、LLM 客户端、能力路由与子智能体执行器；
//! 构建结果 AgentComponents 以 Arc 在所有会话间只读共享。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::EngineSettings;
use crate::capability::{CapabilityLoader, CapabilityRouter, CapabilitySource};
use crate::config::AppConfig;
use crate::core::TaskScheduler;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::SubagentExecutor;
use crate::tools::{EchoTool, ListDirTool, ReadFileTool, ToolExecutor, ToolRegistry, WriteFileTool};

/// 按配置创建 LLM 客户端；provider 为 mock 或未设置 OPENAI_API_KEY 时回退 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "openai" && api_key.is_some() {
        let timeout = Duration::from_secs(cfg.llm.timeouts.request.max(1));
        let client = OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            api_key.as_deref(),
            timeout,
        );
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        return Arc::new(client);
    } else if provider != "mock" {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
    }
    Arc::new(MockLlmClient::new())
}

/// Agent 构建器：统一配置和初始化各个组件
pub struct AgentBuilder {
    config: AppConfig,
    workspace: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Option<ToolRegistry>,
    capability_source: Option<Arc<dyn CapabilitySource>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            llm: None,
            tools: None,
            capability_source: None,
        }
    }

    /// 指定 LLM 客户端（测试或嵌入使用），否则按配置创建
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 指定工具注册表，否则使用内置工具
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 指定能力包来源，否则从 capabilities_dir（或默认目录）加载
    pub fn with_capability_source(mut self, source: Arc<dyn CapabilitySource>) -> Self {
        self.capability_source = Some(source);
        self
    }

    /// 内置工具：echo + 沙箱文件工具
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(ReadFileTool::new(&self.workspace));
        tools.register(ListDirTool::new(&self.workspace));
        tools.register(WriteFileTool::new(&self.workspace));
        tools
    }

    fn build_capability_source(&self) -> Arc<dyn CapabilitySource> {
        match &self.config.app.capabilities_dir {
            Some(dir) => Arc::new(CapabilityLoader::new(dir)),
            None => Arc::new(CapabilityLoader::from_default()),
        }
    }

    /// 构建完整的 AgentComponents；能力包加载失败时以空目录启动，可稍后 refresh
    pub async fn build_components(self) -> Arc<AgentComponents> {
        let llm = match &self.llm {
            Some(llm) => Arc::clone(llm),
            None => create_llm_from_config(&self.config),
        };
        let tools = match &self.tools {
            Some(t) => t.clone(),
            None => self.build_tool_registry(),
        };
        let source = match &self.capability_source {
            Some(s) => Arc::clone(s),
            None => self.build_capability_source(),
        };

        let router = CapabilityRouter::new(source);
        if let Err(e) = router.refresh().await {
            tracing::warn!("Failed to load capabilities: {:#}", e);
        }

        let scheduler = TaskScheduler::new(self.config.tools.max_blocking_tools);
        let executor = Arc::new(ToolExecutor::new(
            scheduler,
            self.config.tools.tool_timeout_secs,
        ));

        let settings = EngineSettings::from_config(&self.config);
        let mut subagents = SubagentExecutor::new(Arc::clone(&llm), Arc::clone(&executor))
            .with_max_summary_chars(self.config.subagent.max_summary_chars)
            .with_token_budget(settings.token_budget);
        if let Some(prompt) = &self.config.subagent.system_prompt {
            subagents = subagents.with_system_prompt(prompt);
        }

        tracing::info!(
            tools = tools.len(),
            capabilities = router.snapshot().len(),
            llm = llm.name(),
            "agent components ready"
        );

        Arc::new(AgentComponents {
            llm,
            tools: Arc::new(tools),
            executor,
            router: Arc::new(router),
            subagents: Arc::new(subagents),
            settings,
            config: self.config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// 预构建的组件：所有会话共享
pub struct AgentComponents {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub router: Arc<CapabilityRouter>,
    pub subagents: Arc<SubagentExecutor>,
    pub settings: EngineSettings,
    pub config: AppConfig,
}

impl AgentComponents {
    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl std::fmt::Debug for AgentComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentComponents")
            .field("llm", &self.llm.name())
            .field("tools", &self.tools)
            .field("router", &self.router)
            .finish()
    }
}

/// 便捷函数：加载配置并准备工作目录
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = config
        .tools
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        tracing::warn!(path = %workspace.display(), "cannot create workspace: {}", e);
    }
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    AgentBuilder::new(config, workspace)
}
