//! Speech synthesis: the engine capability, playback state shared with the
//! interruption path, and the feeder the coordinator drives.

use crate::audio::AudioError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod elevenlabs;
pub mod feeder;
pub mod playback;

pub use elevenlabs::{ElevenLabsEngine, ElevenLabsEngineFactory};
pub use feeder::SpeechSynthesisFeeder;
pub use playback::{PlaybackSession, PlaybackState, PlaybackStats};

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("TTS engine failed to initialize: {0}")]
    Initialization(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("API error: {message}")]
    ApiError { message: String },
    #[error("Audio decode error: {0}")]
    Decode(String),
    #[error("Audio output error: {0}")]
    Audio(#[from] AudioError),
    #[error("Synthesis stream closed")]
    Closed,
    #[error("Unrecoverable engine state: {0}")]
    Unrecoverable(String),
}

impl TtsError {
    /// The engine instance cannot be reused and has to be recreated.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TtsError::Initialization(_) | TtsError::Closed | TtsError::Unrecoverable(_)
        )
    }
}

/// Playback tuning passed to every `play_async`
#[derive(Debug, Clone)]
pub struct PlaybackParams {
    /// Pause inserted after commas and other clause breaks
    pub comma_pause: Duration,
    /// Pause inserted after sentence terminators
    pub sentence_pause: Duration,
    /// Characters buffered before the first text is sent to the engine
    pub min_first_fragment_len: usize,
    /// Audio collected before the first write to the sink
    pub buffer_threshold: Duration,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            comma_pause: Duration::from_millis(100),
            sentence_pause: Duration::from_millis(300),
            min_first_fragment_len: 10,
            buffer_threshold: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub voice_id: String,
    pub model: String,
    /// 0.7 (slow) to 1.2 (fast)
    pub speed: f32,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(), // Rachel voice
            model: "eleven_flash_v2_5".to_string(),       // Fast model for low latency
            speed: 1.0,
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

/// A streaming TTS engine instance.
///
/// Methods are synchronous so `stop` can run straight from the
/// interruption callback.
pub trait SynthesisEngine: Send {
    /// Queue text. The empty string marks the end of the current response.
    fn feed(&mut self, text: &str) -> Result<(), TtsError>;

    /// Start generating audio from buffered and future text.
    fn play_async(&mut self, params: &PlaybackParams) -> Result<(), TtsError>;

    /// Drop pending text and silence output now.
    fn stop(&mut self) -> Result<(), TtsError>;

    fn is_playing(&self) -> bool;
}

/// Creates engines that report playback through the given state
pub trait SynthesisEngineFactory: Send + Sync {
    fn create(&self, state: Arc<PlaybackState>) -> Result<Box<dyn SynthesisEngine>, TtsError>;
}

static CLAUSE_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([,;:])(\s|$)").unwrap_or_else(|e| panic!("invalid clause regex: {}", e))
});
static SENTENCE_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([.!?])(\s|$)").unwrap_or_else(|e| panic!("invalid sentence regex: {}", e))
});

fn break_tag(pause: Duration) -> String {
    format!(r#" <break time="{:.1}s" />"#, pause.as_secs_f32())
}

/// Add SSML pauses after clause and sentence punctuation.
pub fn insert_pauses(text: &str, params: &PlaybackParams) -> String {
    let mut out = text.to_string();
    if !params.sentence_pause.is_zero() {
        let tag = break_tag(params.sentence_pause);
        out = SENTENCE_BREAK
            .replace_all(&out, |caps: &regex::Captures| format!("{}{}{}", &caps[1], tag, &caps[2]))
            .into_owned();
    }
    if !params.comma_pause.is_zero() {
        let tag = break_tag(params.comma_pause);
        out = CLAUSE_BREAK
            .replace_all(&out, |caps: &regex::Captures| format!("{}{}{}", &caps[1], tag, &caps[2]))
            .into_owned();
    }
    out
}
