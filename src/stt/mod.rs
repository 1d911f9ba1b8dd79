//! Speech recognition: the engine capability, the callback bridge it reports
//! through, and the recognition stream the coordinator consumes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

pub mod fireworks;
pub mod recognition;

pub use fireworks::{FireworksEngine, FireworksEngineFactory};
pub use recognition::{
    RecognitionEvent, RecognitionSource, RecognitionStats, SpeechRecognitionStream, Utterance,
    UtteranceStatus,
};

#[derive(Error, Debug)]
pub enum SttError {
    #[error("STT engine failed to initialize: {0}")]
    Initialization(String),
    #[error("WebSocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("API error: {message}")]
    ApiError { message: String },
    #[error("Audio format error: {0}")]
    AudioFormat(String),
    #[error("Response parsing error: {0}")]
    ParseError(String),
    #[error("Streaming error: {0}")]
    Streaming(String),
}

impl SttError {
    /// Whether the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SttError::Initialization(_))
    }
}

/// Voice activity and end-of-speech tuning
#[derive(Debug, Clone)]
pub struct SttSensitivity {
    /// Silero sensitivity, 0.0 (deaf) to 1.0 (hair trigger)
    pub silero_sensitivity: f32,
    /// Energy gate aggressiveness, 0 (lenient) to 3 (strict)
    pub webrtc_sensitivity: u8,
    /// Silence that ends an utterance
    pub post_speech_silence: Duration,
    /// Shorter recordings are not finalized on silence
    pub min_length_of_recording: Duration,
    /// Quiet time required between two recordings
    pub min_gap_between_recordings: Duration,
    /// Promote a stable partial to a final before the full silence window
    pub early_transcription_enabled: bool,
    /// Share of `post_speech_silence` after which a partial is promoted
    pub early_transcription_fraction: f32,
    /// Partials this short (in characters) are never promoted
    pub early_transcription_min_chars: usize,
}

impl Default for SttSensitivity {
    fn default() -> Self {
        Self {
            silero_sensitivity: 0.4,
            webrtc_sensitivity: 2,
            post_speech_silence: Duration::from_millis(400),
            min_length_of_recording: Duration::from_millis(300),
            min_gap_between_recordings: Duration::ZERO,
            early_transcription_enabled: true,
            early_transcription_fraction: 0.7,
            early_transcription_min_chars: 3,
        }
    }
}

impl SttSensitivity {
    /// Silence after which a stable partial becomes a synthetic final.
    pub fn early_transcription_delay(&self) -> Duration {
        self.post_speech_silence
            .mul_f32(self.early_transcription_fraction.clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Model hint passed to the engine, engine default when `None`
    pub model: Option<String>,
    pub language: Option<String>,
    pub temperature: Option<f32>,
    pub prompt: Option<String>,
    pub server_timeout: Duration,
    /// Audio kept from before voice activity so onsets are not clipped
    pub pre_roll: Duration,
    /// Engine events buffered for the recognition stream
    pub event_queue_capacity: usize,
    pub sensitivity: SttSensitivity,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model: None,
            language: Some("en".to_string()),
            temperature: Some(0.0),
            prompt: None,
            server_timeout: Duration::from_millis(10000),
            pre_roll: Duration::from_millis(300),
            event_queue_capacity: 256,
            sensitivity: SttSensitivity::default(),
        }
    }
}

/// What an engine reports, in the order it happens. Recording events carry
/// the id of the recording they belong to, so late results of a finished
/// recording can be told apart from the one in progress.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RecordingStart(u64),
    RecordingStop(u64),
    /// Voice activity paused inside a recording
    SilenceStarted(Instant),
    /// Voice activity came back before the recording ended
    SpeechResumed,
    Partial(u64, String),
    Final(u64, String),
}

/// Invoked synchronously on recording start, before the event is queued.
pub type InterruptHook = Arc<dyn Fn() + Send + Sync>;

/// Callback surface handed to an engine.
///
/// Every callback only flips the recording flag and enqueues; the one
/// exception is the interrupt hook, which runs on recording start so
/// playback stops without waiting for the coordinator.
///
/// Engines that overlap recordings hand each one its own copy from
/// [`EngineCallbacks::for_recording`]; the plain callbacks report as
/// recording 0.
#[derive(Clone)]
pub struct EngineCallbacks {
    events: mpsc::Sender<EngineEvent>,
    recording: Arc<AtomicBool>,
    latest_recording: Arc<AtomicU64>,
    recording_id: u64,
    interrupt_hook: Option<InterruptHook>,
}

impl EngineCallbacks {
    pub(crate) fn new(
        events: mpsc::Sender<EngineEvent>,
        recording: Arc<AtomicBool>,
        interrupt_hook: Option<InterruptHook>,
    ) -> Self {
        Self {
            events,
            recording,
            latest_recording: Arc::new(AtomicU64::new(0)),
            recording_id: 0,
            interrupt_hook,
        }
    }

    /// Callbacks that attribute everything they report to recording `id`.
    pub fn for_recording(&self, id: u64) -> Self {
        Self {
            recording_id: id,
            ..self.clone()
        }
    }

    pub fn recording_id(&self) -> u64 {
        self.recording_id
    }

    pub fn on_recording_start(&self) {
        self.latest_recording
            .fetch_max(self.recording_id, Ordering::AcqRel);
        self.recording.store(true, Ordering::Release);
        if let Some(hook) = &self.interrupt_hook {
            hook();
        }
        self.enqueue(EngineEvent::RecordingStart(self.recording_id));
    }

    /// A recording that was superseded leaves the flag to the newer one.
    pub fn on_recording_stop(&self) {
        if self.latest_recording.load(Ordering::Acquire) <= self.recording_id {
            self.recording.store(false, Ordering::Release);
        }
        self.enqueue(EngineEvent::RecordingStop(self.recording_id));
    }

    pub fn on_silence_started(&self) {
        self.enqueue(EngineEvent::SilenceStarted(Instant::now()));
    }

    pub fn on_speech_resumed(&self) {
        self.enqueue(EngineEvent::SpeechResumed);
    }

    pub fn on_partial(&self, text: impl Into<String>) {
        self.enqueue(EngineEvent::Partial(self.recording_id, text.into()));
    }

    pub fn on_final(&self, text: impl Into<String>) {
        self.enqueue(EngineEvent::Final(self.recording_id, text.into()));
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn enqueue(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => match event {
                EngineEvent::Partial(..) | EngineEvent::SilenceStarted(_) => {
                    log::debug!("🎤 Event queue full, dropping {:?}", event);
                }
                other => log::warn!("🎤 Event queue full, lost {:?}", other),
            },
            Err(TrySendError::Closed(_)) => {
                log::debug!("🎤 Recognition stream gone, event ignored");
            }
        }
    }
}

/// A running STT engine
#[async_trait::async_trait]
pub trait SpeechEngine: Send {
    /// Push canonical 16 kHz mono samples.
    async fn feed_audio(&mut self, samples: &[i16]) -> Result<(), SttError>;

    /// Close any open stream and release the engine.
    async fn shutdown(&mut self);
}

/// Creates engines wired to a set of callbacks
pub trait SpeechEngineFactory: Send + Sync {
    fn initialize(
        &self,
        config: &RecognitionConfig,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn SpeechEngine>, SttError>;
}
