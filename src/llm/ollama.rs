use super::stream::parse_json_lines;
use super::{ChatDelta, ChatMessage, ChatModel, ChatStream, LlmConfig, LlmError, LlmProvider, Role, ToolCall};
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};

/// Local models served by Ollama's `/api/chat`
pub struct OllamaModel {
    client: Client,
    base_url: String,
    model: String,
    config: LlmConfig,
}

impl OllamaModel {
    pub fn new(base_url: String, config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model_name(),
            config,
        })
    }

    fn build_payload(&self, messages: &[ChatMessage], tools: &[Value]) -> Value {
        let messages_json: Vec<Value> = messages
            .iter()
            .map(|msg| {
                let mut value = json!({
                    "role": msg.role.as_str(),
                    "content": msg.content
                });
                if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
                    value["tool_calls"] = msg
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments
                                }
                            })
                        })
                        .collect();
                }
                value
            })
            .collect();

        let mut payload = json!({
            "model": self.model,
            "messages": messages_json,
            "stream": true,
            "options": {
                "temperature": self.config.temperature
            }
        });
        if let Some(max_tokens) = self.config.max_tokens {
            payload["options"]["num_predict"] = json!(max_tokens);
        }
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
        }
        payload
    }
}

/// Text and complete tool calls carried by one response line.
fn parse_line(line: &Value, next_call_id: &mut usize) -> Result<(Option<String>, Vec<ToolCall>), LlmError> {
    if let Some(error) = line.get("error").and_then(|e| e.as_str()) {
        return Err(LlmError::ApiError {
            status: 0,
            message: error.to_string(),
        });
    }
    let message = &line["message"];
    let text = message["content"]
        .as_str()
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let mut calls = Vec::new();
    if let Some(raw_calls) = message["tool_calls"].as_array() {
        for raw in raw_calls {
            let Some(name) = raw["function"]["name"].as_str() else {
                continue;
            };
            let arguments = match &raw["function"]["arguments"] {
                Value::String(s) => serde_json::from_str(s)
                    .map_err(|e| LlmError::ParseError(format!("tool arguments: {}", e)))?,
                Value::Null => json!({}),
                other => other.clone(),
            };
            *next_call_id += 1;
            calls.push(ToolCall {
                id: format!("call_{}", next_call_id),
                name: name.to_string(),
                arguments,
            });
        }
    }
    Ok((text, calls))
}

fn delta_stream(
    lines: impl Stream<Item = Result<Value, LlmError>> + Send,
) -> impl Stream<Item = Result<ChatDelta, LlmError>> + Send {
    async_stream::try_stream! {
        let mut lines = Box::pin(lines);
        let mut calls = Vec::new();
        let mut next_call_id = 0usize;
        while let Some(line) = lines.next().await {
            let line = line?;
            let (text, mut line_calls) = parse_line(&line, &mut next_call_id)?;
            if let Some(text) = text {
                yield ChatDelta::Text(text);
            }
            calls.append(&mut line_calls);
            if line["done"].as_bool().unwrap_or(false) {
                break;
            }
        }
        if !calls.is_empty() {
            yield ChatDelta::ToolCalls(calls);
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for OllamaModel {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ChatStream, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let payload = self.build_payload(messages, tools);

        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        Ok(Box::pin(delta_stream(parse_json_lines(response))))
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn temperature(&self) -> f32 {
        self.config.temperature
    }
}
