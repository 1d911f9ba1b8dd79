use super::{EngineCallbacks, EngineEvent, InterruptHook, RecognitionConfig, SttSensitivity};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceStatus {
    Partial,
    Final,
}

/// A span of recognized speech. Text is replaced on every partial update and
/// frozen once the utterance is final.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    seq: u64,
    text: String,
    status: UtteranceStatus,
    early: bool,
}

impl Utterance {
    fn open(seq: u64) -> Self {
        Self {
            seq,
            text: String::new(),
            status: UtteranceStatus::Partial,
            early: false,
        }
    }

    /// Build an already-final utterance, for injecting transcripts directly.
    pub fn finalized(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
            status: UtteranceStatus::Final,
            early: false,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn status(&self) -> UtteranceStatus {
        self.status
    }

    pub fn is_final(&self) -> bool {
        self.status == UtteranceStatus::Final
    }

    /// Finalized by the silence heuristic rather than by the engine.
    pub fn was_promoted_early(&self) -> bool {
        self.early
    }

    fn replace_text(&mut self, text: &str) -> bool {
        if self.is_final() {
            return false;
        }
        self.text.clear();
        self.text.push_str(text);
        true
    }

    fn finalize(mut self, text: Option<&str>, early: bool) -> Self {
        if let Some(text) = text {
            self.replace_text(text);
        }
        self.text = self.text.trim().to_string();
        self.status = UtteranceStatus::Final;
        self.early = early;
        self
    }
}

/// What the coordinator sees
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    RecordingStart,
    Partial(String),
    Final(Utterance),
}

/// Anything the coordinator can pull recognition events from
#[async_trait::async_trait]
pub trait RecognitionSource: Send {
    /// `None` means the source is finished for good.
    async fn next_event(&mut self) -> Option<RecognitionEvent>;
}

#[async_trait::async_trait]
impl RecognitionSource for mpsc::Receiver<RecognitionEvent> {
    async fn next_event(&mut self) -> Option<RecognitionEvent> {
        self.recv().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecognitionStats {
    pub utterances: u64,
    pub finals: u64,
    pub early_finals: u64,
    pub suppressed_finals: u64,
    pub empty_utterances: u64,
    pub last_final_at: Option<DateTime<Utc>>,
}

/// Turns engine callbacks into an ordered, awaitable event stream and applies
/// the early end-of-speech heuristic.
///
/// Per utterance the stream yields `RecordingStart`, zero or more `Partial`s,
/// then at most one `Final`. When a non-trivial partial has been followed by
/// silence for `early_transcription_fraction` of the end-of-speech window the
/// partial is promoted to a `Final` straight away; the engine's own final for
/// that recording is then swallowed. This trades a small risk of clipping a
/// slow speaker for faster turn-taking.
///
/// A new recording can start while the engine is still transcribing the
/// previous one. Late partials of the old recording are dropped; its final,
/// if nothing was delivered for it, is prepended to the new utterance.
pub struct SpeechRecognitionStream {
    events: mpsc::Receiver<EngineEvent>,
    recording: Arc<AtomicBool>,
    sensitivity: SttSensitivity,
    current: Option<Utterance>,
    next_seq: u64,
    silence_since: Option<Instant>,
    promoted: bool,
    active_recording: u64,
    /// Recording replaced before its final arrived
    superseded: Option<u64>,
    /// Transcript of the superseded recording, waiting for the current final
    carry: Option<String>,
    backlog: VecDeque<RecognitionEvent>,
    stats: RecognitionStats,
}

impl SpeechRecognitionStream {
    /// Create the stream and the callbacks an engine should report through.
    pub fn new(
        config: &RecognitionConfig,
        interrupt_hook: Option<InterruptHook>,
    ) -> (Self, EngineCallbacks) {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let recording = Arc::new(AtomicBool::new(false));
        let callbacks = EngineCallbacks::new(tx, Arc::clone(&recording), interrupt_hook);
        let stream = Self {
            events: rx,
            recording,
            sensitivity: config.sensitivity.clone(),
            current: None,
            next_seq: 0,
            silence_since: None,
            promoted: false,
            active_recording: 0,
            superseded: None,
            carry: None,
            backlog: VecDeque::new(),
            stats: RecognitionStats::default(),
        };
        (stream, callbacks)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &RecognitionStats {
        &self.stats
    }

    /// The utterance currently being recognized, if any.
    pub fn current(&self) -> Option<&Utterance> {
        self.current.as_ref()
    }

    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }

            let engine_event = match self.early_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        biased;
                        event = self.events.recv() => event,
                        _ = tokio::time::sleep_until(deadline) => {
                            if let Some(event) = self.promote_current() {
                                return Some(event);
                            }
                            continue;
                        }
                    }
                }
                None => self.events.recv().await,
            };

            match engine_event {
                Some(event) => {
                    if let Some(out) = self.handle(event) {
                        return Some(out);
                    }
                }
                None => return None,
            }
        }
    }

    fn early_deadline(&self) -> Option<Instant> {
        if !self.sensitivity.early_transcription_enabled || self.promoted {
            return None;
        }
        let since = self.silence_since?;
        let current = self.current.as_ref()?;
        if current.text().trim().chars().count() <= self.sensitivity.early_transcription_min_chars {
            return None;
        }
        Some(since + self.sensitivity.early_transcription_delay())
    }

    fn open_utterance(&mut self) -> RecognitionEvent {
        self.next_seq += 1;
        self.stats.utterances += 1;
        if let Some(abandoned) = self.current.replace(Utterance::open(self.next_seq)) {
            log::debug!(
                "🎤 Utterance {} ended without a transcript",
                abandoned.seq()
            );
        }
        self.silence_since = None;
        self.promoted = false;
        self.carry = None;
        RecognitionEvent::RecordingStart
    }

    fn handle(&mut self, event: EngineEvent) -> Option<RecognitionEvent> {
        match event {
            EngineEvent::Partial(id, _) | EngineEvent::RecordingStop(id)
                if id < self.active_recording =>
            {
                None
            }
            EngineEvent::Final(id, text) if id < self.active_recording => {
                self.late_final(id, &text);
                None
            }
            EngineEvent::RecordingStart(id) => {
                log::debug!("🎤 Recording {} started", id);
                if id > self.active_recording {
                    if self.current.is_some() {
                        self.superseded = Some(self.active_recording);
                    }
                    self.active_recording = id;
                }
                Some(self.open_utterance())
            }
            EngineEvent::RecordingStop(_) => {
                self.silence_since = None;
                None
            }
            EngineEvent::SilenceStarted(at) => {
                if self.current.is_some() && !self.promoted {
                    self.silence_since = Some(at);
                }
                None
            }
            EngineEvent::SpeechResumed => {
                self.silence_since = None;
                if self.promoted {
                    // Kept talking after an early final: that is new speech
                    log::debug!("🎤 Speech resumed after early final");
                    return Some(self.open_utterance());
                }
                None
            }
            EngineEvent::Partial(_, text) => {
                if self.promoted || text.trim().is_empty() {
                    return None;
                }
                match self.current.as_mut() {
                    Some(current) => {
                        current.replace_text(&text);
                        Some(RecognitionEvent::Partial(text))
                    }
                    None => {
                        let start = self.open_utterance();
                        if let Some(current) = self.current.as_mut() {
                            current.replace_text(&text);
                        }
                        self.backlog.push_back(RecognitionEvent::Partial(text));
                        Some(start)
                    }
                }
            }
            EngineEvent::Final(_, text) => {
                self.silence_since = None;
                if self.promoted {
                    self.promoted = false;
                    self.stats.suppressed_finals += 1;
                    log::debug!("🎤 Engine final already delivered early: '{}'", text);
                    return None;
                }
                if text.trim().is_empty() {
                    self.stats.empty_utterances += 1;
                    self.current = None;
                    self.carry = None;
                    return None;
                }
                match self.current.take() {
                    Some(current) => Some(self.deliver(current.finalize(Some(&text), false))),
                    None => {
                        let start = self.open_utterance();
                        let utterance = self.current.take().map(|u| u.finalize(Some(&text), false));
                        if let Some(utterance) = utterance {
                            let event = self.deliver(utterance);
                            self.backlog.push_back(event);
                        }
                        Some(start)
                    }
                }
            }
        }
    }

    fn promote_current(&mut self) -> Option<RecognitionEvent> {
        let current = self.current.take()?;
        self.silence_since = None;
        self.promoted = true;
        self.stats.early_finals += 1;
        log::info!("🎤 Early transcription on silence: '{}'", current.text().trim());
        Some(self.deliver(current.finalize(None, true)))
    }

    /// Final of a recording that has already been replaced by a newer one.
    fn late_final(&mut self, recording: u64, text: &str) {
        let text = text.trim();
        if self.superseded != Some(recording) {
            self.stats.suppressed_finals += 1;
            log::debug!("🎤 Late final of recording {} dropped: '{}'", recording, text);
            return;
        }
        self.superseded = None;
        if text.is_empty() {
            self.stats.empty_utterances += 1;
        } else if self.current.is_some() {
            log::debug!("🎤 Carrying '{}' into the current utterance", text);
            self.carry = Some(text.to_string());
        } else {
            self.stats.suppressed_finals += 1;
            log::warn!("🎤 Transcript of recording {} arrived too late: '{}'", recording, text);
        }
    }

    fn deliver(&mut self, mut utterance: Utterance) -> RecognitionEvent {
        if let Some(carry) = self.carry.take() {
            utterance.text = format!("{} {}", carry, utterance.text);
        }
        self.stats.finals += 1;
        self.stats.last_final_at = Some(Utc::now());
        RecognitionEvent::Final(utterance)
    }
}

#[async_trait::async_trait]
impl RecognitionSource for SpeechRecognitionStream {
    async fn next_event(&mut self) -> Option<RecognitionEvent> {
        SpeechRecognitionStream::next_event(self).await
    }
}
