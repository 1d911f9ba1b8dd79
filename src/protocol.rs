//! Wire format of the websocket transport.
//!
//! Inbound binary frames are raw PCM16 audio in the format the client
//! announced at connect time. Inbound text frames are control messages.
//! Outbound text frames are JSON events; synthesized audio goes out either
//! as binary frames or base64 inside JSON.

use crate::output::OutputEvent;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),
}

/// Events sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ServerMessage {
    PartialTranscription(String),
    FinalTranscription(String),
    AssistantPartial(String),
    AssistantComplete(String),
    RecordingStart,
    TtsStart,
    ToolStart(String),
    /// Base64 PCM16
    AudioChunk(String),
}

/// Control messages sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    /// Client playback started
    TtsStart,
    /// Client playback stopped
    TtsStop,
    /// Stop talking and listen
    Interrupt,
}

impl ClientControl {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// How synthesized audio is framed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString, clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AudioEncoding {
    #[default]
    Binary,
    Base64,
}

/// One outbound websocket frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Encode an output event for the wire.
pub fn encode_event(event: OutputEvent, encoding: AudioEncoding) -> Result<Frame, ProtocolError> {
    let message = match event {
        OutputEvent::AudioChunk(pcm) => match encoding {
            AudioEncoding::Binary => return Ok(Frame::Binary(pcm)),
            AudioEncoding::Base64 => ServerMessage::AudioChunk(BASE64.encode(pcm)),
        },
        OutputEvent::PartialTranscription(text) => ServerMessage::PartialTranscription(text),
        OutputEvent::FinalTranscription(text) => ServerMessage::FinalTranscription(text),
        OutputEvent::AssistantPartial(text) => ServerMessage::AssistantPartial(text),
        OutputEvent::AssistantComplete(text) => ServerMessage::AssistantComplete(text),
        OutputEvent::RecordingStart => ServerMessage::RecordingStart,
        OutputEvent::TtsStart => ServerMessage::TtsStart,
        OutputEvent::ToolStart(name) => ServerMessage::ToolStart(name),
    };
    Ok(Frame::Text(serde_json::to_string(&message)?))
}

/// PCM layout the client sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for ClientAudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: crate::SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl ClientAudioFormat {
    /// Read `sample_rate` and `channels` from a request query string,
    /// falling back to 16 kHz mono.
    pub fn from_query(query: Option<&str>) -> Result<Self, ProtocolError> {
        let mut format = Self::default();
        let Some(query) = query else {
            return Ok(format);
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "sample_rate" => {
                    format.sample_rate = value
                        .parse()
                        .map_err(|_| ProtocolError::InvalidFormat(format!("sample_rate={}", value)))?;
                }
                "channels" => {
                    format.channels = value
                        .parse()
                        .map_err(|_| ProtocolError::InvalidFormat(format!("channels={}", value)))?;
                }
                _ => {}
            }
        }
        if !(8000..=192_000).contains(&format.sample_rate) {
            return Err(ProtocolError::InvalidFormat(format!(
                "unsupported sample rate {}",
                format.sample_rate
            )));
        }
        if format.channels == 0 || format.channels > 8 {
            return Err(ProtocolError::InvalidFormat(format!(
                "unsupported channel count {}",
                format.channels
            )));
        }
        Ok(format)
    }
}
