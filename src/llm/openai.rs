//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；请求携带 function tools，
//! 回复中解析 tool_calls。支持 DeepSeek、OpenAI、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, LlmReply};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::ToolSchema;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client、model 名与单次请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout,
            usage: TokenUsage::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(to_openai_messages(messages)?)
            .build()
            .map_err(malformed)?;
        if !tools.is_empty() {
            let declared = Value::Array(tools.iter().map(to_openai_tool).collect());
            request.tools = Some(serde_json::from_value(declared).map_err(malformed)?);
        }
        Ok(request)
    }
}

fn malformed(e: impl std::fmt::Display) -> LlmError {
    LlmError::Malformed(e.to_string())
}

fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| {
            let msg: ChatCompletionRequestMessage = match m.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.text())
                    .build()
                    .map_err(malformed)?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(m.text())
                    .build()
                    .map_err(malformed)?
                    .into(),
                // 带工具调用的 assistant 消息按线上格式整体反序列化
                Role::Assistant if m.has_tool_calls() => {
                    serde_json::from_value(assistant_tool_calls_json(m)).map_err(malformed)?
                }
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.text())
                    .build()
                    .map_err(malformed)?
                    .into(),
                Role::Tool => ChatCompletionRequestToolMessageArgs::default()
                    .content(m.text())
                    .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                    .build()
                    .map_err(malformed)?
                    .into(),
            };
            Ok(msg)
        })
        .collect()
}

fn assistant_tool_calls_json(m: &Message) -> Value {
    let calls: Vec<Value> = m
        .tool_calls
        .iter()
        .map(|tc| {
            json!({
                "id": tc.id,
                "type": "function",
                "function": {
                    "name": tc.name,
                    "arguments": tc.arguments.to_string(),
                }
            })
        })
        .collect();
    json!({ "role": "assistant", "content": m.content, "tool_calls": calls })
}

fn to_openai_tool(schema: &ToolSchema) -> Value {
    // function parameters 至少需要 {"type": "object"}
    let parameters = match schema.parameters.as_object() {
        Some(obj) if obj.contains_key("type") => schema.parameters.clone(),
        Some(obj) => {
            let mut obj = obj.clone();
            obj.insert("type".to_string(), json!("object"));
            Value::Object(obj)
        }
        None => json!({ "type": "object", "properties": {} }),
    };
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": parameters,
        }
    })
}

/// 从回复的 tool_calls（线上 JSON 形态）解析工具调用。
/// 参数不是合法 JSON 时原样保留为字符串，由工具报参数错误回灌给模型。
fn parse_tool_calls(raw: &Value) -> Vec<ToolCall> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|tc| {
            let id = tc["id"].as_str()?;
            let name = tc["function"]["name"].as_str()?;
            let raw_args = tc["function"]["arguments"].as_str().unwrap_or("");
            let arguments = if raw_args.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(raw_args).unwrap_or_else(|_| Value::String(raw_args.to_string()))
            };
            Some(ToolCall::new(id, name, arguments))
        })
        .collect()
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(err) if err.is_timeout() => LlmError::Timeout,
        OpenAIError::ApiError(api) => {
            let message = api.to_string();
            if message.contains("rate_limit") || message.contains("Rate limit") {
                LlmError::RateLimited {
                    retry_after_secs: None,
                }
            } else {
                LlmError::Request(message)
            }
        }
        e @ OpenAIError::JSONDeserialize(..) => LlmError::Malformed(e.to_string()),
        other => LlmError::Request(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<LlmReply, LlmError> {
        let request = self.build_request(messages, tools)?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| {
                tracing::warn!(model = %self.model, "LLM request failed: {}", e);
                map_openai_error(e)
            })?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("no choices in response".to_string()))?;
        let raw_calls = serde_json::to_value(&choice.message.tool_calls).map_err(malformed)?;

        Ok(LlmReply {
            content: choice.message.content,
            tool_calls: parse_tool_calls(&raw_calls),
        })
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
