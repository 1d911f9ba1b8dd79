use super::{AgentCapability, AgentEvent, AgentInfo, AgentStream, ConversationHistory};
use crate::llm::prompts::ConversationTemplates;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a turn's response yields to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseItem {
    /// Text to show and speak
    Fragment(String),
    /// Informational tool milestone
    ToolStart(String),
}

/// Runs the agent once per turn and owns the conversation history.
pub struct AgentResponseStream {
    agent: Arc<dyn AgentCapability>,
    history: ConversationHistory,
}

impl AgentResponseStream {
    pub fn new(agent: Arc<dyn AgentCapability>, max_history_turns: usize) -> Self {
        Self {
            agent,
            history: ConversationHistory::new(max_history_turns),
        }
    }

    /// Start answering `user_text` with the current history window.
    pub fn begin(&self, user_text: &str) -> TurnResponse {
        let cancel = CancellationToken::new();
        let window = self.history.window();
        let stream = self.agent.stream(user_text, &window, cancel.clone());
        TurnResponse::new(stream, cancel)
    }

    /// Append a completed turn. Only called once the response is complete.
    pub fn record_turn(&mut self, user_text: &str, response_text: &str) {
        self.history.record_turn(user_text, response_text);
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn info(&self) -> AgentInfo {
        self.agent.info()
    }
}

/// One invocation of the agent as a single-consumer, cancelable iterator.
///
/// A provider failure is turned into one apologetic fragment, after which
/// the response ends. Once cancelled nothing further is yielded, even if the
/// agent had more queued.
pub struct TurnResponse {
    stream: AgentStream,
    cancel: CancellationToken,
    text: String,
    finished: bool,
    failed: bool,
}

impl TurnResponse {
    fn new(stream: AgentStream, cancel: CancellationToken) -> Self {
        Self {
            stream,
            cancel,
            text: String::new(),
            finished: false,
            failed: false,
        }
    }

    pub async fn next(&mut self) -> Option<ResponseItem> {
        loop {
            if self.finished || self.cancel.is_cancelled() {
                return None;
            }

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                event = self.stream.next() => event,
            };

            match event {
                Some(Ok(AgentEvent::Token(token))) => {
                    if token.is_empty() {
                        continue;
                    }
                    self.text.push_str(&token);
                    return Some(ResponseItem::Fragment(token));
                }
                Some(Ok(AgentEvent::ToolStart { name })) => {
                    return Some(ResponseItem::ToolStart(name));
                }
                Some(Err(e)) => {
                    log::error!("🤖 Agent failed mid-response: {}", e);
                    self.finished = true;
                    self.failed = true;
                    let separator = if self.text.is_empty() || self.text.ends_with(char::is_whitespace) {
                        ""
                    } else {
                        " "
                    };
                    let fragment = format!("{}{}", separator, ConversationTemplates::provider_error());
                    self.text.push_str(&fragment);
                    return Some(ResponseItem::Fragment(fragment));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Stop the agent; later calls to `next` return `None`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Everything yielded so far, error fragment included.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl Drop for TurnResponse {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentError;
    use crate::llm::{ChatMessage, LlmError, LlmProvider};
    use std::sync::Mutex;

    /// Replays a script and remembers the history it was given
    struct ScriptedAgent {
        script: Vec<Result<AgentEvent, String>>,
        seen_history: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Result<AgentEvent, String>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                seen_history: Mutex::new(Vec::new()),
            })
        }
    }

    impl AgentCapability for ScriptedAgent {
        fn stream(
            &self,
            _user_message: &str,
            history: &[ChatMessage],
            _cancel: CancellationToken,
        ) -> AgentStream {
            self.seen_history.lock().unwrap().push(history.to_vec());
            let items: Vec<Result<AgentEvent, AgentError>> = self
                .script
                .iter()
                .cloned()
                .map(|item| item.map_err(|e| AgentError::Llm(LlmError::Stream(e))))
                .collect();
            Box::pin(futures_util::stream::iter(items))
        }

        fn info(&self) -> AgentInfo {
            AgentInfo {
                provider: LlmProvider::Groq,
                model: "scripted".to_string(),
                temperature: 0.0,
                tool_names: vec![],
            }
        }
    }

    fn token(t: &str) -> Result<AgentEvent, String> {
        Ok(AgentEvent::Token(t.to_string()))
    }

    #[tokio::test]
    async fn test_fragments_accumulate() {
        let agent = ScriptedAgent::new(vec![
            token("The"),
            token(""),
            Ok(AgentEvent::ToolStart {
                name: "get_weather".to_string(),
            }),
            token(" weather"),
        ]);
        let responses = AgentResponseStream::new(agent, 3);
        let mut turn = responses.begin("weather?");

        assert_eq!(turn.next().await, Some(ResponseItem::Fragment("The".to_string())));
        assert_eq!(
            turn.next().await,
            Some(ResponseItem::ToolStart("get_weather".to_string()))
        );
        assert_eq!(
            turn.next().await,
            Some(ResponseItem::Fragment(" weather".to_string()))
        );
        assert_eq!(turn.next().await, None);
        assert!(turn.is_finished());
        assert_eq!(turn.text(), "The weather");
    }

    #[tokio::test]
    async fn test_error_becomes_final_fragment() {
        let agent = ScriptedAgent::new(vec![token("I"), Err("rate limited".to_string()), token("never")]);
        let responses = AgentResponseStream::new(agent, 3);
        let mut turn = responses.begin("hello");

        turn.next().await;
        match turn.next().await {
            Some(ResponseItem::Fragment(text)) => {
                assert!(text.starts_with(" Sorry"));
            }
            other => panic!("expected error fragment, got {:?}", other),
        }
        assert_eq!(turn.next().await, None);
        assert!(turn.failed());
        assert!(turn.text().starts_with("I Sorry"));
    }

    #[tokio::test]
    async fn test_cancel_stops_yielding() {
        let agent = ScriptedAgent::new(vec![token("one"), token("two")]);
        let responses = AgentResponseStream::new(agent, 3);
        let mut turn = responses.begin("count");
        assert!(turn.next().await.is_some());
        turn.cancel();
        assert_eq!(turn.next().await, None);
        assert_eq!(turn.text(), "one");
    }

    #[tokio::test]
    async fn test_history_window_is_passed_to_agent() {
        let agent = ScriptedAgent::new(vec![token("ok")]);
        let mut responses = AgentResponseStream::new(Arc::clone(&agent) as Arc<dyn AgentCapability>, 1);
        responses.record_turn("first", "one");
        responses.record_turn("second", "two");
        let _turn = responses.begin("third");

        let seen = agent.seen_history.lock().unwrap();
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[0][0].content, "second");
    }
}
