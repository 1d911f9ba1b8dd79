//! Session output sink: where user-visible events of a conversation go.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Events delivered to the conversation's output surface
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    PartialTranscription(String),
    FinalTranscription(String),
    AssistantPartial(String),
    AssistantComplete(String),
    RecordingStart,
    TtsStart,
    ToolStart(String),
    /// 16-bit PCM at 16 kHz mono
    AudioChunk(Vec<u8>),
}

impl OutputEvent {
    pub fn is_audio(&self) -> bool {
        matches!(self, OutputEvent::AudioChunk(_))
    }
}

/// The output surface of one conversation.
///
/// `emit` never blocks; events of a turn can be withdrawn with `clear_turn`
/// as long as they have not been delivered yet.
#[async_trait::async_trait]
pub trait SessionOutput: Send + Sync {
    /// Deliver an event, tagged with the turn that produced it.
    fn emit(&self, turn: Option<u64>, event: OutputEvent);

    /// Deliver synthesized audio of playback run `generation`. Audio of a run
    /// older than the last `clear_audio` is discarded.
    fn emit_audio(&self, generation: u64, pcm: Vec<u8>);

    /// Drop undelivered events of an interrupted turn.
    fn clear_turn(&self, turn: u64);

    /// Drop undelivered events of a turn cut short by the session ending.
    fn abandon_turn(&self, turn: u64) {
        self.clear_turn(turn);
    }

    /// Drop undelivered audio and refuse audio of runs before `generation`.
    fn clear_audio(&self, generation: u64);

    /// Resolve once all emitted audio has been handed to the surface.
    async fn audio_flushed(&self);
}

/// Prints the conversation like a terminal chat.
pub struct ConsoleOutput {
    show_partials: bool,
}

impl ConsoleOutput {
    pub fn new(show_partials: bool) -> Self {
        Self { show_partials }
    }
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait::async_trait]
impl SessionOutput for ConsoleOutput {
    fn emit(&self, _turn: Option<u64>, event: OutputEvent) {
        let mut stdout = std::io::stdout().lock();
        let _ = match event {
            OutputEvent::PartialTranscription(text) if self.show_partials => {
                write!(stdout, "\r\x1b[2K🎤 {}", text)
            }
            OutputEvent::FinalTranscription(text) => writeln!(stdout, "\r\x1b[2K👤 You: {}", text),
            OutputEvent::AssistantPartial(text) => write!(stdout, "{}", text),
            OutputEvent::AssistantComplete(_) => writeln!(stdout),
            OutputEvent::TtsStart => write!(stdout, "🤖 "),
            OutputEvent::ToolStart(name) => write!(stdout, "[🔧 {}] ", name),
            _ => Ok(()),
        };
        let _ = stdout.flush();
    }

    fn emit_audio(&self, _generation: u64, _pcm: Vec<u8>) {}

    fn clear_turn(&self, _turn: u64) {
        println!(" [interrupted]");
    }

    fn abandon_turn(&self, _turn: u64) {
        println!();
    }

    fn clear_audio(&self, _generation: u64) {}

    async fn audio_flushed(&self) {}
}

#[derive(Debug)]
struct QueuedEvent {
    turn: Option<u64>,
    event: OutputEvent,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<QueuedEvent>,
    closed: bool,
    dropped: u64,
    /// Audio of playback runs before this one is refused
    audio_floor: u64,
}

impl QueueState {
    fn has_audio(&self) -> bool {
        self.events.iter().any(|q| q.event.is_audio())
    }
}

/// Bounded, turn-tagged queue drained by a transport writer.
///
/// When full, the oldest event is dropped.
pub struct OutputQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    available: Notify,
    flushed: Notify,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            available: Notify::new(),
            flushed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next event to deliver, or `None` once closed and empty. Single consumer.
    pub async fn recv(&self) -> Option<OutputEvent> {
        loop {
            {
                let mut state = self.lock();
                if let Some(queued) = state.events.pop_front() {
                    if queued.event.is_audio() && !state.has_audio() {
                        self.flushed.notify_waiters();
                    }
                    return Some(queued.event);
                }
                if state.closed {
                    return None;
                }
            }
            self.available.notified().await;
        }
    }

    /// Stop accepting events. Queued events can still be received.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_one();
        self.flushed.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn push(&self, mut state: MutexGuard<'_, QueueState>, turn: Option<u64>, event: OutputEvent) {
        if state.closed {
            return;
        }
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            state.dropped += 1;
            if state.dropped.is_power_of_two() {
                log::warn!("🔌 Output queue full, {} events dropped so far", state.dropped);
            }
        }
        state.events.push_back(QueuedEvent { turn, event });
        drop(state);
        self.available.notify_one();
    }
}

#[async_trait::async_trait]
impl SessionOutput for OutputQueue {
    fn emit(&self, turn: Option<u64>, event: OutputEvent) {
        self.push(self.lock(), turn, event);
    }

    fn emit_audio(&self, generation: u64, pcm: Vec<u8>) {
        let state = self.lock();
        if generation < state.audio_floor {
            log::debug!("🔌 Dropped audio of stopped playback {}", generation);
            return;
        }
        self.push(state, None, OutputEvent::AudioChunk(pcm));
    }

    fn clear_turn(&self, turn: u64) {
        let mut state = self.lock();
        let before = state.events.len();
        state.events.retain(|q| q.turn != Some(turn));
        let removed = before - state.events.len();
        if removed > 0 {
            log::debug!("🔌 Withdrew {} queued events of turn {}", removed, turn);
        }
        if !state.has_audio() {
            self.flushed.notify_waiters();
        }
    }

    fn clear_audio(&self, generation: u64) {
        let mut state = self.lock();
        state.audio_floor = state.audio_floor.max(generation);
        state.events.retain(|q| !q.event.is_audio());
        self.flushed.notify_waiters();
    }

    async fn audio_flushed(&self) {
        loop {
            let notified = self.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.closed || !state.has_audio() {
                    return;
                }
            }
            notified.await;
        }
    }
}
