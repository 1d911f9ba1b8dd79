//! The agent capability and the per-turn response stream wrapped around it.

use crate::llm::{ChatMessage, LlmError, LlmProvider, ToolError};
use futures_util::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod history;
pub mod response;

pub use history::ConversationHistory;
pub use response::{AgentResponseStream, ResponseItem, TurnResponse};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("Agent stream failed: {0}")]
    Stream(String),
}

/// Something the agent produced while answering
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Token(String),
    /// The agent started running a tool; informational only
    ToolStart { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentInfo {
    pub provider: LlmProvider,
    pub model: String,
    pub temperature: f32,
    pub tool_names: Vec<String>,
}

pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, AgentError>> + Send>>;

/// An agent answers one message given prior context.
///
/// Every call to `stream` starts an independent, lazy invocation. The
/// returned stream must stop producing events (and stop starting tools)
/// once `cancel` fires.
pub trait AgentCapability: Send + Sync {
    fn stream(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        cancel: CancellationToken,
    ) -> AgentStream;

    fn info(&self) -> AgentInfo;
}
