use crate::llm::ChatMessage;
use std::collections::VecDeque;

/// Fixed window of completed turns, stored as user/assistant pairs.
///
/// Older turns are dropped outright once the window is full.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: VecDeque<ChatMessage>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            entries: VecDeque::with_capacity(max_turns * 2 + 2),
            max_turns,
        }
    }

    /// Append one completed turn, evicting the oldest pairs past the cap.
    pub fn record_turn(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.entries.push_back(ChatMessage::user(user));
        self.entries.push_back(ChatMessage::assistant(assistant));
        while self.entries.len() > self.max_turns * 2 {
            self.entries.pop_front();
            self.entries.pop_front();
        }
    }

    /// Snapshot of the context sent with the next request.
    pub fn window(&self) -> Vec<ChatMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn turns(&self) -> usize {
        self.entries.len() / 2
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Completed turns as (user, assistant) text pairs, oldest first.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .collect::<Vec<_>>()
            .chunks(2)
            .filter_map(|pair| match pair {
                [user, assistant] => Some((user.content.clone(), assistant.content.clone())),
                _ => None,
            })
            .collect()
    }
}
