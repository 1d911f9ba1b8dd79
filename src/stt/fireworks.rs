use super::{EngineCallbacks, RecognitionConfig, SpeechEngine, SpeechEngineFactory, SttError};
use crate::audio::i16_to_pcm16;
use crate::vad::{create_detector, SpeechDetector, FRAME_SAMPLES};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

const STREAMING_ENDPOINT: &str =
    "wss://audio-streaming.us-virginia-1.direct.fireworks.ai/v1/audio/transcriptions/streaming";

/// Audio duration of one detection frame
const FRAME_DURATION: Duration = Duration::from_millis(
    (FRAME_SAMPLES as u64 * 1000) / crate::SAMPLE_RATE as u64,
);

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct StreamingResponse {
    task: Option<String>,
    language: Option<String>,
    text: Option<String>,
    segments: Option<Vec<StreamingSegment>>,
}

#[derive(Debug, Deserialize)]
struct StreamingSegment {
    id: u32,
    text: String,
}

enum SessionCommand {
    Audio(Vec<u8>),
    Finish,
}

pub struct FireworksEngineFactory {
    api_key: String,
}

impl FireworksEngineFactory {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

impl SpeechEngineFactory for FireworksEngineFactory {
    fn initialize(
        &self,
        config: &RecognitionConfig,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn SpeechEngine>, SttError> {
        if self.api_key.trim().is_empty() {
            return Err(SttError::Initialization(
                "Fireworks API key is empty".to_string(),
            ));
        }
        let engine = FireworksEngine::new(self.api_key.clone(), config.clone(), callbacks)?;
        Ok(Box::new(engine))
    }
}

struct Recording {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
    started_at: Duration,
    silence_since: Option<Duration>,
}

/// Streaming recognizer backed by the Fireworks websocket API.
///
/// Local VAD decides when a recording starts and ends; each recording gets
/// its own websocket session. Timing runs on an audio clock (samples fed),
/// so file input behaves the same as live capture.
pub struct FireworksEngine {
    api_key: String,
    config: RecognitionConfig,
    callbacks: EngineCallbacks,
    detector: Box<dyn SpeechDetector>,
    pending: Vec<i16>,
    pre_roll: VecDeque<Vec<i16>>,
    pre_roll_frames: usize,
    clock: Duration,
    recording: Option<Recording>,
    last_recording_end: Option<Duration>,
    next_recording: u64,
    /// Sessions still delivering the final of a finished recording
    finishing: Vec<JoinHandle<()>>,
}

impl FireworksEngine {
    pub fn new(
        api_key: String,
        config: RecognitionConfig,
        callbacks: EngineCallbacks,
    ) -> Result<Self, SttError> {
        let detector = create_detector(&config.sensitivity)?;
        let pre_roll_frames =
            (config.pre_roll.as_millis() / FRAME_DURATION.as_millis().max(1)) as usize;
        log::info!(
            "🎤 Fireworks STT ready (language: {:?}, pre-roll: {} frames)",
            config.language,
            pre_roll_frames
        );
        Ok(Self {
            api_key,
            config,
            callbacks,
            detector,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            pre_roll: VecDeque::with_capacity(pre_roll_frames + 1),
            pre_roll_frames,
            clock: Duration::ZERO,
            recording: None,
            last_recording_end: None,
            next_recording: 0,
            finishing: Vec::new(),
        })
    }

    fn session_url(&self) -> Result<Url, SttError> {
        build_session_url(&self.api_key, &self.config)
    }

    async fn process_frame(&mut self, frame: Vec<i16>) -> Result<(), SttError> {
        let speech = self.detector.is_speech(&frame)?;
        self.clock += FRAME_DURATION;

        let Some(recording) = self.recording.as_mut() else {
            let gap_ok = self.last_recording_end.map_or(true, |end| {
                self.clock.saturating_sub(end) >= self.config.sensitivity.min_gap_between_recordings
            });
            if speech && gap_ok {
                return self.start_recording(frame).await;
            }
            self.pre_roll.push_back(frame);
            while self.pre_roll.len() > self.pre_roll_frames {
                self.pre_roll.pop_front();
            }
            return Ok(());
        };

        if recording
            .commands
            .send(SessionCommand::Audio(i16_to_pcm16(&frame)))
            .is_err()
        {
            log::warn!("🎤 Transcription session ended early");
            self.recording = None;
            self.last_recording_end = Some(self.clock);
            return Ok(());
        }

        let sensitivity = &self.config.sensitivity;
        if speech {
            if recording.silence_since.take().is_some() {
                self.callbacks.on_speech_resumed();
            }
            return Ok(());
        }

        let silence_since = match recording.silence_since {
            Some(since) => since,
            None => {
                recording.silence_since = Some(self.clock);
                self.callbacks.on_silence_started();
                self.clock
            }
        };
        let silent_for = self.clock.saturating_sub(silence_since);
        let recorded_for = self.clock.saturating_sub(recording.started_at);
        if silent_for >= sensitivity.post_speech_silence
            && recorded_for >= sensitivity.min_length_of_recording
        {
            self.finish_recording();
        }
        Ok(())
    }

    /// Opens a new session right away; a session still finishing the previous
    /// recording keeps running and reports under its own recording id.
    async fn start_recording(&mut self, first_frame: Vec<i16>) -> Result<(), SttError> {
        self.finishing.retain(|task| !task.is_finished());

        let url = self.session_url()?;
        self.next_recording += 1;
        let callbacks = self.callbacks.for_recording(self.next_recording);
        callbacks.on_recording_start();

        let (commands, command_rx) = mpsc::unbounded_channel();
        for frame in self.pre_roll.drain(..) {
            let _ = commands.send(SessionCommand::Audio(i16_to_pcm16(&frame)));
        }
        let _ = commands.send(SessionCommand::Audio(i16_to_pcm16(&first_frame)));

        let task = tokio::spawn(run_session(
            url,
            command_rx,
            callbacks,
            self.config.server_timeout,
        ));
        log::debug!(
            "🎤 Recording {} started at {:?} ({} session(s) still finishing)",
            self.next_recording,
            self.clock,
            self.finishing.len()
        );
        self.recording = Some(Recording {
            commands,
            task,
            started_at: self.clock,
            silence_since: None,
        });
        Ok(())
    }

    fn finish_recording(&mut self) {
        if let Some(recording) = self.recording.take() {
            log::debug!(
                "🎤 Recording finished after {:?}",
                self.clock.saturating_sub(recording.started_at)
            );
            let _ = recording.commands.send(SessionCommand::Finish);
            self.finishing.push(recording.task);
            self.last_recording_end = Some(self.clock);
            self.detector.reset();
        }
    }

    /// Let finished recordings deliver their finals before the engine goes away.
    async fn await_finishing(&mut self) {
        let limit = self.config.server_timeout;
        for mut task in self.finishing.drain(..) {
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                log::warn!("🎤 Transcription did not finish in {:?}", limit);
                task.abort();
            }
        }
    }
}

#[async_trait::async_trait]
impl SpeechEngine for FireworksEngine {
    async fn feed_audio(&mut self, samples: &[i16]) -> Result<(), SttError> {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..FRAME_SAMPLES).collect();
            self.process_frame(frame).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.finish_recording();
        self.await_finishing().await;
        self.pending.clear();
        self.pre_roll.clear();
        log::info!("🎤 Fireworks STT shut down");
    }
}

fn build_session_url(api_key: &str, config: &RecognitionConfig) -> Result<Url, SttError> {
    let mut url = Url::parse(STREAMING_ENDPOINT)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(model) = &config.model {
            query.append_pair("model", model);
        }
        if let Some(language) = &config.language {
            query.append_pair("language", language);
        }
        if let Some(temperature) = config.temperature {
            query.append_pair("temperature", &temperature.to_string());
        }
        if let Some(prompt) = &config.prompt {
            query.append_pair("prompt", prompt);
        }
        query.append_pair("response_format", "verbose_json");
        query.append_pair("Authorization", api_key);
    }
    Ok(url)
}

/// One websocket session per recording. Always ends with a final (possibly
/// empty) followed by recording stop.
async fn run_session(
    url: Url,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    callbacks: EngineCallbacks,
    server_timeout: Duration,
) {
    let transcript = match stream_session(&url, &mut commands, &callbacks, server_timeout).await {
        Ok(transcript) => transcript,
        Err(e) => {
            log::error!("🎤 Transcription session failed: {}", e);
            String::new()
        }
    };
    log::info!("🎤 Transcript: '{}'", transcript);
    callbacks.on_final(transcript);
    callbacks.on_recording_stop();
}

async fn stream_session(
    url: &Url,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    callbacks: &EngineCallbacks,
    server_timeout: Duration,
) -> Result<String, SttError> {
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    let mut transcript = String::new();
    let mut last_partial = String::new();
    let mut segments: BTreeMap<u32, String> = BTreeMap::new();
    let mut finishing = false;
    let mut chunks_sent = 0usize;

    loop {
        tokio::select! {
            command = commands.recv(), if !finishing => {
                match command {
                    Some(SessionCommand::Audio(pcm)) => {
                        chunks_sent += 1;
                        write.send(Message::Binary(pcm.into())).await?;
                    }
                    Some(SessionCommand::Finish) | None => {
                        finishing = true;
                        let checkpoint = json!({"checkpoint_id": "final"}).to_string();
                        log::debug!("🎤 Sending final checkpoint after {} chunks", chunks_sent);
                        write.send(Message::Text(checkpoint.into())).await?;
                    }
                }
            }
            message = tokio::time::timeout(server_timeout, read.next()) => {
                let message = match message {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(_) if finishing => {
                        log::warn!("🎤 Timed out waiting for final checkpoint");
                        break;
                    }
                    Err(_) => continue,
                };
                match message? {
                    Message::Text(text) => {
                        let text = text.to_string();
                        let data: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(data) => data,
                            Err(e) => {
                                log::warn!("🎤 Unparseable server message: {}", e);
                                continue;
                            }
                        };
                        if data.get("checkpoint_id").and_then(|v| v.as_str()) == Some("final") {
                            log::debug!("🎤 Final checkpoint acknowledged");
                            break;
                        }
                        if let Some(error) = data.get("error") {
                            return Err(SttError::ApiError { message: error.to_string() });
                        }
                        let Ok(response) = serde_json::from_value::<StreamingResponse>(data) else {
                            continue;
                        };
                        if let Some(new_segments) = response.segments {
                            for segment in new_segments {
                                segments.insert(segment.id, segment.text);
                            }
                        }
                        let text = response
                            .text
                            .filter(|t| !t.trim().is_empty())
                            .unwrap_or_else(|| join_segments(&segments));
                        if !text.trim().is_empty() && text != last_partial {
                            callbacks.on_partial(text.clone());
                            last_partial = text.clone();
                            transcript = text;
                        }
                    }
                    Message::Close(frame) => {
                        log::debug!("🎤 Server closed connection: {:?}", frame);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = write.close().await;
    Ok(transcript)
}

fn join_segments(segments: &BTreeMap<u32, String>) -> String {
    segments
        .values()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
