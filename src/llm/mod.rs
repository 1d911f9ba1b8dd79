//! Chat model providers and the tool-calling agent built on them.

use crate::config::ApiConfig;
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod groq;
pub mod integration;
pub mod ollama;
pub mod prompts;
pub mod stream;
pub mod tools;

pub use groq::GroqModel;
pub use integration::ToolCallingAgent;
pub use ollama::OllamaModel;
pub use prompts::SystemPrompts;
pub use tools::{create_default_registry, Tool, ToolError, ToolRegistry};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Response parsing error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString, clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LlmProvider {
    #[default]
    Groq,
    Ollama,
}

impl LlmProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Groq => "meta-llama/llama-4-scout-17b-16e-instruct",
            LlmProvider::Ollama => "qwen3:4b-instruct-2507-q4_K_M",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Provider default when `None`
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Groq,
            model: None,
            temperature: 0.7,
            max_tokens: Some(1024),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl LlmConfig {
    pub fn model_name(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Calls requested by an assistant message
    pub tool_calls: Vec<ToolCall>,
    /// Call a tool message answers
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// One increment of a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDelta {
    Text(String),
    /// Complete tool calls, emitted once they are fully assembled
    ToolCalls(Vec<ToolCall>),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, LlmError>> + Send>>;

/// A streaming chat completion endpoint
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a completion. `tools` are OpenAI-style function definitions.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ChatStream, LlmError>;

    fn provider(&self) -> LlmProvider;

    fn model(&self) -> &str;

    fn temperature(&self) -> f32;
}

/// Build the chat model for the configured provider.
pub fn create_chat_model(
    config: &LlmConfig,
    api: &ApiConfig,
) -> Result<Arc<dyn ChatModel>, LlmError> {
    let model: Arc<dyn ChatModel> = match config.provider {
        LlmProvider::Groq => {
            let key = api.groq_key().ok_or_else(|| {
                LlmError::Config("GROQ_API_KEY is required for the groq provider".to_string())
            })?;
            Arc::new(GroqModel::new(key.to_string(), config.clone())?)
        }
        LlmProvider::Ollama => Arc::new(OllamaModel::new(
            api.ollama_base_url.clone(),
            config.clone(),
        )?),
    };
    log::info!(
        "🤖 Using {} model '{}' (temperature {:.1})",
        model.provider(),
        model.model(),
        model.temperature()
    );
    Ok(model)
}
