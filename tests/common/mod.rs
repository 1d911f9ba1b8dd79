//! Scripted engines shared by the integration tests.
//!
//! Every mock writes to one [`Timeline`] so tests can assert on the order in
//! which the coordinator touched speech synthesis, the agent and the output.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio::task::JoinHandle;
use voice_agent_rs::{
    agent::{AgentCapability, AgentError, AgentEvent, AgentInfo, AgentStream},
    audio::AudioSink,
    coordinator::TurnState,
    llm::{ChatMessage, LlmProvider},
    output::{OutputEvent, SessionOutput},
    stt::{EngineCallbacks, RecognitionConfig, SpeechEngine, SpeechEngineFactory, SttError},
    tts::{PlaybackParams, PlaybackState, SynthesisEngine, SynthesisEngineFactory, TtsError},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    TtsFeed(String),
    TtsPlay,
    TtsStop,
    AgentStream(String),
    Output(Option<u64>, OutputEvent),
    ClearTurn(u64),
    AbandonTurn(u64),
    ClearAudio,
}

#[derive(Debug, Default)]
pub struct Timeline {
    entries: Mutex<Vec<Entry>>,
}

impl Timeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entry: Entry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &Entry) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, pred: impl Fn(&Entry) -> bool) -> usize {
        self.entries().iter().filter(|e| pred(e)).count()
    }

    pub fn outputs(&self) -> Vec<OutputEvent> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Output(_, event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Text fed to synthesis, end markers excluded
    pub fn spoken(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::TtsFeed(text) if !text.is_empty() => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Vec<String> {
        self.outputs()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::AssistantComplete(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Speech synthesis

/// Playback runs until the end marker arrives when `auto_finish` is set,
/// otherwise until stopped.
pub struct MockTtsFactory {
    timeline: Arc<Timeline>,
    auto_finish: Arc<Mutex<bool>>,
}

impl MockTtsFactory {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self {
            timeline,
            auto_finish: Arc::new(Mutex::new(true)),
        }
    }

    /// Keep speaking after the response ended, until interrupted.
    pub fn hold_playback(&self) {
        *self.auto_finish.lock().unwrap() = false;
    }

    pub fn release_playback(&self) {
        *self.auto_finish.lock().unwrap() = true;
    }
}

impl SynthesisEngineFactory for MockTtsFactory {
    fn create(&self, state: Arc<PlaybackState>) -> Result<Box<dyn SynthesisEngine>, TtsError> {
        Ok(Box::new(MockTtsEngine {
            timeline: Arc::clone(&self.timeline),
            auto_finish: Arc::clone(&self.auto_finish),
            state,
            generation: None,
        }))
    }
}

struct MockTtsEngine {
    timeline: Arc<Timeline>,
    auto_finish: Arc<Mutex<bool>>,
    state: Arc<PlaybackState>,
    generation: Option<u64>,
}

impl SynthesisEngine for MockTtsEngine {
    fn feed(&mut self, text: &str) -> Result<(), TtsError> {
        self.timeline.push(Entry::TtsFeed(text.to_string()));
        if text.is_empty() && *self.auto_finish.lock().unwrap() {
            if let Some(generation) = self.generation.take() {
                self.state.mark_finished(generation);
            }
        }
        Ok(())
    }

    fn play_async(&mut self, _params: &PlaybackParams) -> Result<(), TtsError> {
        self.timeline.push(Entry::TtsPlay);
        self.generation = self.state.mark_started();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TtsError> {
        self.timeline.push(Entry::TtsStop);
        self.generation = None;
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.generation.is_some() && self.state.is_active()
    }
}

/// Writes a small PCM chunk every few milliseconds from its own task, like
/// a network synthesizer. Between checking that its run is current and
/// writing, the task yields, so a stop can land in that gap.
pub struct StreamingTtsFactory {
    sink: Arc<dyn AudioSink>,
}

impl StreamingTtsFactory {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self { sink }
    }
}

impl SynthesisEngineFactory for StreamingTtsFactory {
    fn create(&self, state: Arc<PlaybackState>) -> Result<Box<dyn SynthesisEngine>, TtsError> {
        Ok(Box::new(StreamingTtsEngine {
            sink: Arc::clone(&self.sink),
            state,
            task: None,
        }))
    }
}

struct StreamingTtsEngine {
    sink: Arc<dyn AudioSink>,
    state: Arc<PlaybackState>,
    task: Option<JoinHandle<()>>,
}

impl SynthesisEngine for StreamingTtsEngine {
    fn feed(&mut self, _text: &str) -> Result<(), TtsError> {
        Ok(())
    }

    fn play_async(&mut self, _params: &PlaybackParams) -> Result<(), TtsError> {
        let Some(generation) = self.state.mark_started() else {
            return Ok(());
        };
        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);
        self.task = Some(tokio::spawn(async move {
            while state.generation() == generation {
                tokio::task::yield_now().await;
                if sink.write(generation, &[0u8; 320]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TtsError> {
        // The stream task is left to notice on its own
        self.task = None;
        self.state.mark_stopped();
        self.sink.clear(self.state.generation());
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

// ---------------------------------------------------------------------------
// Agent

#[derive(Debug, Clone)]
pub enum Step {
    Token(String),
    Tool(String),
    Delay(Duration),
    /// Produce nothing more until cancelled
    Hang,
    Fail(String),
}

pub fn tokens(parts: &[&str]) -> Vec<Step> {
    parts.iter().map(|p| Step::Token(p.to_string())).collect()
}

#[derive(Debug, Clone)]
pub struct AgentCall {
    pub message: String,
    pub history: Vec<ChatMessage>,
    pub cancel: CancellationToken,
}

/// Answers each message with the next queued script; echoes once the
/// queue is empty.
pub struct ScriptedAgent {
    timeline: Arc<Timeline>,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    calls: Mutex<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self {
            timeline,
            scripts: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentCapability for ScriptedAgent {
    fn stream(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        cancel: CancellationToken,
    ) -> AgentStream {
        self.timeline
            .push(Entry::AgentStream(user_message.to_string()));
        self.calls.lock().unwrap().push(AgentCall {
            message: user_message.to_string(),
            history: history.to_vec(),
            cancel: cancel.clone(),
        });
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Token(format!("You said: {}", user_message))]);

        Box::pin(async_stream::stream! {
            for step in steps {
                if cancel.is_cancelled() {
                    break;
                }
                match step {
                    Step::Token(text) => yield Ok(AgentEvent::Token(text)),
                    Step::Tool(name) => yield Ok(AgentEvent::ToolStart { name }),
                    Step::Delay(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        break;
                    }
                    Step::Fail(reason) => {
                        yield Err(AgentError::Stream(reason));
                        break;
                    }
                }
            }
        })
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            provider: LlmProvider::Ollama,
            model: "scripted".to_string(),
            temperature: 0.0,
            tool_names: vec!["get_time".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Output

pub struct RecordingOutput {
    timeline: Arc<Timeline>,
}

impl RecordingOutput {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self { timeline }
    }
}

#[async_trait::async_trait]
impl SessionOutput for RecordingOutput {
    fn emit(&self, turn: Option<u64>, event: OutputEvent) {
        self.timeline.push(Entry::Output(turn, event));
    }

    fn emit_audio(&self, _generation: u64, pcm: Vec<u8>) {
        self.timeline.push(Entry::Output(None, OutputEvent::AudioChunk(pcm)));
    }

    fn clear_turn(&self, turn: u64) {
        self.timeline.push(Entry::ClearTurn(turn));
    }

    fn abandon_turn(&self, turn: u64) {
        self.timeline.push(Entry::AbandonTurn(turn));
    }

    fn clear_audio(&self, _generation: u64) {
        self.timeline.push(Entry::ClearAudio);
    }

    async fn audio_flushed(&self) {}
}

// ---------------------------------------------------------------------------
// Speech recognition

/// Chunks louder than this count as speech
const SPEECH_LEVEL: i16 = 500;
/// Quiet chunks that end an utterance
const END_OF_SPEECH_CHUNKS: usize = 3;

/// Level-triggered recognizer: loud chunks open a recording, a run of quiet
/// chunks closes it with the next queued transcript.
pub struct ScriptedSttFactory {
    transcripts: Arc<Mutex<VecDeque<String>>>,
}

impl ScriptedSttFactory {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Arc::new(Mutex::new(
                transcripts.iter().map(|t| t.to_string()).collect(),
            )),
        }
    }
}

impl SpeechEngineFactory for ScriptedSttFactory {
    fn initialize(
        &self,
        _config: &RecognitionConfig,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn SpeechEngine>, SttError> {
        Ok(Box::new(ScriptedSttEngine {
            callbacks,
            transcripts: Arc::clone(&self.transcripts),
            recording: false,
            quiet_chunks: 0,
        }))
    }
}

/// Refuses to start, like an engine without credentials
pub struct FailingSttFactory;

impl SpeechEngineFactory for FailingSttFactory {
    fn initialize(
        &self,
        _config: &RecognitionConfig,
        _callbacks: EngineCallbacks,
    ) -> Result<Box<dyn SpeechEngine>, SttError> {
        Err(SttError::Initialization("no credentials".to_string()))
    }
}

struct ScriptedSttEngine {
    callbacks: EngineCallbacks,
    transcripts: Arc<Mutex<VecDeque<String>>>,
    recording: bool,
    quiet_chunks: usize,
}

#[async_trait::async_trait]
impl SpeechEngine for ScriptedSttEngine {
    async fn feed_audio(&mut self, samples: &[i16]) -> Result<(), SttError> {
        let loud = samples.iter().any(|s| s.unsigned_abs() > SPEECH_LEVEL as u16);
        if loud {
            self.quiet_chunks = 0;
            if !self.recording {
                self.recording = true;
                self.callbacks.on_recording_start();
                if let Some(next) = self.transcripts.lock().unwrap().front() {
                    self.callbacks.on_partial(next.clone());
                }
            }
            return Ok(());
        }

        if self.recording {
            self.quiet_chunks += 1;
            if self.quiet_chunks == 1 {
                self.callbacks.on_silence_started();
            }
            if self.quiet_chunks >= END_OF_SPEECH_CHUNKS {
                self.recording = false;
                self.callbacks.on_recording_stop();
                let text = self.transcripts.lock().unwrap().pop_front().unwrap_or_default();
                self.callbacks.on_final(text);
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Audio

/// 100 ms of a 440 Hz tone as PCM16 bytes
pub fn tone_chunk(rate: u32, channels: u16) -> Vec<u8> {
    let frames = rate as usize / 10;
    let mut bytes = Vec::with_capacity(frames * channels as usize * 2);
    for i in 0..frames {
        let t = i as f32 / rate as f32;
        let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
        for _ in 0..channels {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
    }
    bytes
}

/// 100 ms of silence as PCM16 bytes
pub fn silence_chunk(rate: u32, channels: u16) -> Vec<u8> {
    vec![0u8; rate as usize / 10 * channels as usize * 2]
}

// ---------------------------------------------------------------------------
// Waiting

pub async fn wait_for_state(state: &mut watch::Receiver<TurnState>, wanted: TurnState) {
    tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", wanted))
        .unwrap_or_else(|_| panic!("state channel closed waiting for {}", wanted));
}

/// Poll until `pred` holds for the timeline.
pub async fn wait_until(timeline: &Timeline, what: &str, pred: impl Fn(&Timeline) -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !pred(timeline) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if result.is_err() {
        panic!("timed out waiting for {}: {:#?}", what, timeline.entries());
    }
}
