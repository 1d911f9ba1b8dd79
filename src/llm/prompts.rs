// System prompts and spoken fallback phrases

pub struct SystemPrompts;

impl SystemPrompts {
    /// Warm, brief companion tuned for speech output
    pub fn voice_companion() -> &'static str {
        "You are a warm and helpful AI companion designed for voice conversations.

CRITICAL: This is a VOICE conversation. Never use emojis, markdown, asterisks, or any visual symbols.
Keep responses short and conversational. Speak naturally like talking to a friend.
Give direct, clear answers without unnecessary elaboration.

Be friendly and caring, but keep it brief. If someone needs more detail, they'll ask."
    }

    /// Companion prompt plus guidance for the registered tools
    pub fn tool_aware_voice_companion(tool_names: &[String]) -> String {
        if tool_names.is_empty() {
            return Self::voice_companion().to_string();
        }
        format!(
            "{}

You can call these tools: {}.
Use a tool whenever it gives a better answer than guessing, then answer in one or two spoken sentences.
If a tool reports a problem, explain it simply and offer an alternative.",
            Self::voice_companion(),
            tool_names.join(", ")
        )
    }
}

pub struct ConversationTemplates;

impl ConversationTemplates {
    /// Spoken in place of the rest of a response when the provider fails
    pub fn provider_error() -> &'static str {
        "Sorry, I ran into a problem answering that. Please try again."
    }

    /// Spoken when the tool loop keeps asking for more tools
    pub fn too_many_tool_rounds() -> &'static str {
        "Sorry, that took more steps than I can handle right now."
    }
}
