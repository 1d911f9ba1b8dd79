pub mod agent;
pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod output;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use error::{Result, VoiceError};

/// Canonical sample rate shared by recognition, detection and synthesis.
pub const SAMPLE_RATE: u32 = 16000;
