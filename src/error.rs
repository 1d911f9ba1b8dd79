use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio error: {0}")]
    Audio(#[from] crate::audio::AudioError),

    #[error("Speech recognition error: {0}")]
    Stt(#[from] crate::stt::SttError),

    #[error("Speech synthesis error: {0}")]
    Tts(#[from] crate::tts::TtsError),

    #[error("LLM error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Agent error: {0}")]
    Agent(#[from] crate::agent::AgentError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::server::TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(String),
}

impl VoiceError {
    /// Engine-fatal conditions end the session instead of a single turn.
    pub fn is_engine_fatal(&self) -> bool {
        match self {
            VoiceError::Stt(e) => e.is_fatal(),
            VoiceError::Tts(e) => e.is_terminal(),
            _ => false,
        }
    }
}
