use super::prompts::{ConversationTemplates, SystemPrompts};
use super::tools::{ToolError, ToolRegistry};
use super::{ChatDelta, ChatMessage, ChatModel};
use crate::agent::{AgentCapability, AgentError, AgentEvent, AgentInfo, AgentStream};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tool rounds allowed before the agent gives up on a request
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;

/// ReAct-style agent: stream the model, run any tools it asks for, feed the
/// results back, repeat until it answers in plain text.
pub struct ToolCallingAgent {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    max_tool_rounds: usize,
}

impl ToolCallingAgent {
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolRegistry) -> Self {
        let system_prompt = SystemPrompts::tool_aware_voice_companion(&tools.tool_names());
        Self {
            model,
            tools: Arc::new(tools),
            system_prompt,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }
}

fn run_agent(
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    mut messages: Vec<ChatMessage>,
    max_rounds: usize,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + Send {
    async_stream::try_stream! {
        let definitions = tools.get_tool_definitions();
        let mut answered = false;

        'rounds: for round in 1..=max_rounds {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = model.stream_chat(&messages, &definitions) => Some(result),
            };
            let Some(opened) = opened else {
                break 'rounds;
            };
            let mut chat = opened?;

            let mut text = String::new();
            let mut calls = Vec::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'rounds,
                    next = chat.next() => next,
                };
                let Some(delta) = next else {
                    break;
                };
                match delta? {
                    ChatDelta::Text(token) => {
                        text.push_str(&token);
                        yield AgentEvent::Token(token);
                    }
                    ChatDelta::ToolCalls(mut requested) => calls.append(&mut requested),
                }
            }

            if calls.is_empty() {
                answered = true;
                break 'rounds;
            }

            log::debug!("🤖 Round {}: {} tool call(s)", round, calls.len());
            messages.push(ChatMessage::assistant_tool_calls(text, calls.clone()));
            for call in calls {
                if cancel.is_cancelled() {
                    break 'rounds;
                }
                yield AgentEvent::ToolStart { name: call.name.clone() };
                let output = match tools
                    .execute_tool(&call.name, call.arguments.clone(), cancel.clone())
                    .await
                {
                    Ok(output) => output,
                    Err(ToolError::Cancelled) => break 'rounds,
                    // The model gets the failure as the tool result and can apologise
                    Err(e) => format!("Error: {}", e),
                };
                messages.push(ChatMessage::tool(call.id, output));
            }
        }

        if !answered && !cancel.is_cancelled() {
            log::warn!("🤖 Gave up after {} tool rounds", max_rounds);
            yield AgentEvent::Token(ConversationTemplates::too_many_tool_rounds().to_string());
        }
    }
}

impl AgentCapability for ToolCallingAgent {
    fn stream(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        cancel: CancellationToken,
    ) -> AgentStream {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(user_message));

        Box::pin(run_agent(
            Arc::clone(&self.model),
            Arc::clone(&self.tools),
            messages,
            self.max_tool_rounds,
            cancel,
        ))
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            provider: self.model.provider(),
            model: self.model.model().to_string(),
            temperature: self.model.temperature(),
            tool_names: self.tools.tool_names(),
        }
    }
}
