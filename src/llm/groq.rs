use super::stream::{parse_sse_stream, SseEvent};
use super::{ChatDelta, ChatMessage, ChatModel, ChatStream, LlmConfig, LlmError, LlmProvider, Role, ToolCall};
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Groq chat completions over the OpenAI-compatible streaming API
pub struct GroqModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    config: LlmConfig,
}

impl GroqModel {
    pub fn new(api_key: String, config: LlmConfig) -> Result<Self, LlmError> {
        Self::with_base_url(api_key, config, GROQ_BASE_URL.to_string())
    }

    pub fn with_base_url(
        api_key: String,
        config: LlmConfig,
        base_url: String,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url,
            model: config.model_name(),
            config,
        })
    }

    fn build_payload(&self, messages: &[ChatMessage], tools: &[Value]) -> Value {
        let messages_json: Vec<Value> = messages.iter().map(message_to_json).collect();

        let mut payload = json!({
            "model": self.model,
            "messages": messages_json,
            "temperature": self.config.temperature,
            "stream": true
        });

        if let Some(max_tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        if !tools.is_empty() {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!("auto");
        }
        payload
    }
}

fn message_to_json(msg: &ChatMessage) -> Value {
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
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string()
                    }
                })
            })
            .collect();
    }
    if let Some(id) = &msg.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

/// Tool call fragments collected across deltas
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn accumulate_tool_calls(pending: &mut BTreeMap<u64, PartialToolCall>, deltas: &[Value]) {
    for delta in deltas {
        let index = delta["index"].as_u64().unwrap_or(0);
        let entry = pending.entry(index).or_default();
        if let Some(id) = delta["id"].as_str() {
            entry.id = id.to_string();
        }
        if let Some(name) = delta["function"]["name"].as_str() {
            entry.name.push_str(name);
        }
        if let Some(arguments) = delta["function"]["arguments"].as_str() {
            entry.arguments.push_str(arguments);
        }
    }
}

fn finish_tool_calls(pending: BTreeMap<u64, PartialToolCall>) -> Result<Vec<ToolCall>, LlmError> {
    pending
        .into_iter()
        .map(|(index, call)| {
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.arguments).map_err(|e| {
                    LlmError::ParseError(format!("tool call arguments for '{}': {}", call.name, e))
                })?
            };
            let id = if call.id.is_empty() {
                format!("call_{}", index)
            } else {
                call.id
            };
            Ok(ToolCall {
                id,
                name: call.name,
                arguments,
            })
        })
        .collect()
}

/// Turn one decoded chunk into text, collecting tool call fragments.
fn handle_chunk(
    chunk: &Value,
    pending: &mut BTreeMap<u64, PartialToolCall>,
) -> Result<Option<String>, LlmError> {
    if let Some(error) = chunk.get("error") {
        return Err(LlmError::ApiError {
            status: 0,
            message: error.to_string(),
        });
    }
    let Some(choice) = chunk["choices"].get(0) else {
        return Ok(None);
    };
    if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
        accumulate_tool_calls(pending, calls);
    }
    Ok(choice["delta"]["content"]
        .as_str()
        .filter(|text| !text.is_empty())
        .map(str::to_string))
}

/// Decode completion chunks into text deltas, then one batch of tool calls.
fn delta_stream(
    events: impl Stream<Item = Result<SseEvent, LlmError>> + Send,
) -> impl Stream<Item = Result<ChatDelta, LlmError>> + Send {
    async_stream::try_stream! {
        let mut events = Box::pin(events);
        let mut pending: BTreeMap<u64, PartialToolCall> = BTreeMap::new();
        while let Some(event) = events.next().await {
            let event = event?;
            if event.data.trim() == "[DONE]" {
                break;
            }
            let chunk: Value = serde_json::from_str(&event.data)
                .map_err(|e| LlmError::ParseError(e.to_string()))?;
            if let Some(text) = handle_chunk(&chunk, &mut pending)? {
                yield ChatDelta::Text(text);
            }
        }
        if !pending.is_empty() {
            yield ChatDelta::ToolCalls(finish_tool_calls(pending)?);
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for GroqModel {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ChatStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = self.build_payload(messages, tools);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

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

        Ok(Box::pin(delta_stream(parse_sse_stream(response))))
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Groq
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn temperature(&self) -> f32 {
        self.config.temperature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_includes_tools_only_when_present() {
        let model = GroqModel::new("gsk_test".to_string(), LlmConfig::default()).unwrap();
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];

        let payload = model.build_payload(&messages, &[]);
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][1]["role"], "user");
        assert!(payload.get("tools").is_none());

        let tools = vec![json!({"type": "function", "function": {"name": "get_weather"}})];
        let payload = model.build_payload(&messages, &tools);
        assert_eq!(payload["tool_choice"], "auto");
    }

    #[test]
    fn test_tool_messages_serialize_with_ids() {
        let call = ToolCall {
            id: "call_7".to_string(),
            name: "get_weather".to_string(),
            arguments: json!({"city": "Paris"}),
        };
        let assistant = message_to_json(&ChatMessage::assistant_tool_calls("", vec![call]));
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], "{\"city\":\"Paris\"}");

        let tool = message_to_json(&ChatMessage::tool("call_7", "sunny"));
        assert_eq!(tool["tool_call_id"], "call_7");
        assert_eq!(tool["role"], "tool");
    }

    #[test]
    fn test_tool_call_deltas_accumulate_by_index() {
        let mut pending = BTreeMap::new();
        let chunks = [
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "get_weather", "arguments": "{\"ci"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ty\":\"Oslo\"}"}},
                {"index": 1, "function": {"name": "get_random_number", "arguments": ""}}
            ]}}]}),
        ];
        for chunk in &chunks {
            assert_eq!(handle_chunk(chunk, &mut pending).unwrap(), None);
        }
        let calls = finish_tool_calls(pending).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments, json!({"city": "Oslo"}));
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[tokio::test]
    async fn test_delta_stream_ends_at_done() {
        let events = futures_util::stream::iter(vec![
            Ok(SseEvent { event: None, data: r#"{"choices":[{"delta":{"content":"The"}}]}"#.to_string() }),
            Ok(SseEvent { event: None, data: r#"{"choices":[{"delta":{"content":" weather"}}]}"#.to_string() }),
            Ok(SseEvent { event: None, data: "[DONE]".to_string() }),
            Ok(SseEvent { event: None, data: "not reached".to_string() }),
        ]);
        let deltas: Vec<ChatDelta> = delta_stream(events)
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(
            deltas,
            vec![
                ChatDelta::Text("The".to_string()),
                ChatDelta::Text(" weather".to_string())
            ]
        );
    }

    #[test]
    fn test_text_and_error_chunks() {
        let mut pending = BTreeMap::new();
        let text = json!({"choices": [{"delta": {"content": "Hello"}}]});
        assert_eq!(handle_chunk(&text, &mut pending).unwrap().as_deref(), Some("Hello"));

        let error = json!({"error": {"message": "rate limited"}});
        assert!(matches!(
            handle_chunk(&error, &mut pending),
            Err(LlmError::ApiError { .. })
        ));
    }
}
