//! The turn state machine.
//!
//! One task owns the coordinator and everything it mutates: the live turn,
//! the conversation history and the output of the current turn. Recognition
//! events, agent fragments and playback completion are multiplexed with a
//! biased `select!`, so a recording start is always looked at before the
//! next agent fragment.

use crate::agent::{
    AgentCapability, AgentInfo, AgentResponseStream, ConversationHistory, ResponseItem,
    TurnResponse,
};
use crate::config::SessionConfig;
use crate::output::{OutputEvent, SessionOutput};
use crate::stt::{RecognitionEvent, RecognitionSource, Utterance};
use crate::tts::SpeechSynthesisFeeder;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    Responding,
    Speaking,
    Interrupted,
}

impl TurnState {
    /// A turn is live while the agent answers or its answer is being spoken.
    pub fn is_live(&self) -> bool {
        matches!(self, TurnState::Responding | TurnState::Speaking)
    }
}

/// One request/response cycle
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub input: String,
    pub state: TurnState,
    pub started_at: Instant,
    pub first_token_at: Option<Instant>,
    pub playback_started_at: Option<Instant>,
}

impl Turn {
    fn new(id: u64, input: String) -> Self {
        Self {
            id,
            input,
            state: TurnState::Responding,
            started_at: Instant::now(),
            first_token_at: None,
            playback_started_at: None,
        }
    }
}

/// Latency figures logged when a turn completes
#[derive(Debug, Clone, PartialEq)]
pub struct TurnMetrics {
    pub turn_id: u64,
    pub time_to_first_token: Option<Duration>,
    pub time_to_first_audio: Option<Duration>,
    pub total: Duration,
    pub response_chars: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub turns_started: u64,
    pub turns_completed: u64,
    pub turns_interrupted: u64,
    pub turns_failed: u64,
}

/// Why the conversation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The recognition source finished
    SourceClosed,
    /// The user said an exit word
    ExitRequested,
    /// Shut down from outside
    Cancelled,
    /// An engine can no longer be used
    EngineFailure(String),
}

/// Interrupts the live turn from outside the coordinator task, the same way
/// a recording start does: playback stops right away, then the coordinator
/// tears the turn down.
#[derive(Clone)]
pub struct Interrupter {
    feeder: Arc<SpeechSynthesisFeeder>,
    tx: mpsc::UnboundedSender<()>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.feeder.stop();
        let _ = self.tx.send(());
    }
}

struct LiveTurn {
    turn: Turn,
    response: TurnResponse,
    agent_done: bool,
    playback_generation: Option<u64>,
}

async fn next_item(live: &mut Option<LiveTurn>) -> Option<ResponseItem> {
    match live {
        Some(live) => live.response.next().await,
        None => std::future::pending().await,
    }
}

enum Step {
    Shutdown,
    Interrupt,
    Recognition(Option<RecognitionEvent>),
    Agent(Option<ResponseItem>),
    Drained,
}

pub struct TurnCoordinator {
    responses: AgentResponseStream,
    feeder: Arc<SpeechSynthesisFeeder>,
    output: Arc<dyn SessionOutput>,
    config: SessionConfig,
    state_tx: watch::Sender<TurnState>,
    interrupt_tx: mpsc::UnboundedSender<()>,
    interrupt_rx: mpsc::UnboundedReceiver<()>,
    next_turn_id: u64,
    stats: CoordinatorStats,
    last_metrics: Option<TurnMetrics>,
}

impl TurnCoordinator {
    pub fn new(
        agent: Arc<dyn AgentCapability>,
        feeder: Arc<SpeechSynthesisFeeder>,
        output: Arc<dyn SessionOutput>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Idle);
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        Self {
            responses: AgentResponseStream::new(agent, config.max_history_turns),
            feeder,
            output,
            config,
            state_tx,
            interrupt_tx,
            interrupt_rx,
            next_turn_id: 1,
            stats: CoordinatorStats::default(),
            last_metrics: None,
        }
    }

    pub fn state(&self) -> TurnState {
        *self.state_tx.borrow()
    }

    /// Observe every state change.
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state_tx.subscribe()
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            feeder: Arc::clone(&self.feeder),
            tx: self.interrupt_tx.clone(),
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        self.responses.history()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.clone()
    }

    pub fn last_metrics(&self) -> Option<&TurnMetrics> {
        self.last_metrics.as_ref()
    }

    pub fn agent_info(&self) -> AgentInfo {
        self.responses.info()
    }

    fn set_state(&self, state: TurnState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Turn state {} -> {}", previous, state);
        }
    }

    /// Run the conversation until the source ends, an exit word is heard,
    /// `shutdown` fires, or an engine fails for good.
    pub async fn run<S>(&mut self, source: &mut S, shutdown: CancellationToken) -> SessionEnd
    where
        S: RecognitionSource + ?Sized,
    {
        self.set_state(TurnState::Listening);
        let mut live: Option<LiveTurn> = None;

        loop {
            if !self.feeder.is_healthy() {
                self.teardown(&mut live);
                log::error!("🔊 Speech synthesis engine could not be recreated");
                return SessionEnd::EngineFailure("speech synthesis engine unavailable".to_string());
            }

            let agent_live = live.as_ref().is_some_and(|l| !l.agent_done);
            let awaiting_drain = live.as_ref().is_some_and(|l| l.agent_done);

            let step = {
                let feeder = &self.feeder;
                let interrupts = &mut self.interrupt_rx;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Step::Shutdown,
                    Some(()) = interrupts.recv() => Step::Interrupt,
                    event = source.next_event() => Step::Recognition(event),
                    item = next_item(&mut live), if agent_live => Step::Agent(item),
                    _ = feeder.wait_drained(), if awaiting_drain => Step::Drained,
                }
            };

            match step {
                Step::Shutdown => {
                    self.teardown(&mut live);
                    return SessionEnd::Cancelled;
                }
                Step::Interrupt => {
                    if let Some(turn) = live.take() {
                        self.interrupt(turn);
                    }
                }
                Step::Recognition(None) => {
                    log::info!("🎤 Recognition source closed");
                    self.teardown(&mut live);
                    return SessionEnd::SourceClosed;
                }
                Step::Recognition(Some(RecognitionEvent::RecordingStart)) => {
                    match live.take() {
                        Some(turn) => self.interrupt(turn),
                        None => self.set_state(TurnState::Listening),
                    }
                    self.output.emit(None, OutputEvent::RecordingStart);
                }
                Step::Recognition(Some(RecognitionEvent::Partial(text))) => {
                    self.output.emit(None, OutputEvent::PartialTranscription(text));
                }
                Step::Recognition(Some(RecognitionEvent::Final(utterance))) => {
                    if let Some(end) = self.handle_final(utterance, &mut live) {
                        return end;
                    }
                }
                Step::Agent(item) => {
                    if let Some(current) = live.as_mut() {
                        self.handle_item(current, item);
                    }
                }
                Step::Drained => {
                    let Some(turn) = live.take() else {
                        continue;
                    };
                    // Stopped from the interrupt hook before its event got here
                    let cut_off = turn
                        .playback_generation
                        .is_some_and(|generation| generation != self.feeder.state().generation());
                    if cut_off {
                        self.interrupt(turn);
                    } else {
                        self.complete(turn);
                    }
                }
            }
        }
    }

    fn handle_final(&mut self, utterance: Utterance, live: &mut Option<LiveTurn>) -> Option<SessionEnd> {
        let text = utterance.text().trim().to_string();
        if text.is_empty() {
            log::debug!("🎤 Ignoring empty utterance {}", utterance.seq());
            return None;
        }

        log::info!(
            "🎤 Final transcript{}: \"{}\"",
            if utterance.was_promoted_early() { " (early)" } else { "" },
            text
        );
        self.output.emit(None, OutputEvent::FinalTranscription(text.clone()));

        // A new turn never starts while another is live
        if let Some(turn) = live.take() {
            self.interrupt(turn);
        }

        if self.config.is_exit_phrase(&text) {
            log::info!("👋 Exit phrase heard, ending conversation");
            self.set_state(TurnState::Idle);
            return Some(SessionEnd::ExitRequested);
        }

        *live = Some(self.start_turn(text));
        None
    }

    fn start_turn(&mut self, input: String) -> LiveTurn {
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        self.stats.turns_started += 1;

        log::info!("🤖 Turn {} started", id);
        let response = self.responses.begin(&input);
        self.set_state(TurnState::Responding);
        LiveTurn {
            turn: Turn::new(id, input),
            response,
            agent_done: false,
            playback_generation: None,
        }
    }

    fn handle_item(&mut self, live: &mut LiveTurn, item: Option<ResponseItem>) {
        let turn_id = live.turn.id;
        match item {
            Some(ResponseItem::Fragment(text)) => {
                if live.turn.first_token_at.is_none() {
                    live.turn.first_token_at = Some(Instant::now());
                    live.turn.state = TurnState::Speaking;
                    self.set_state(TurnState::Speaking);
                    self.output.emit(Some(turn_id), OutputEvent::TtsStart);
                    if !self.feeder.feed(&text) {
                        log::warn!("🔊 Dropped fragment of turn {}", turn_id);
                    }
                    if self.feeder.start_playback() {
                        live.turn.playback_started_at = Some(Instant::now());
                        live.playback_generation = Some(self.feeder.state().generation());
                    }
                } else if !self.feeder.feed(&text) {
                    log::warn!("🔊 Dropped fragment of turn {}", turn_id);
                }
                self.output.emit(Some(turn_id), OutputEvent::AssistantPartial(text));
            }
            Some(ResponseItem::ToolStart(name)) => {
                log::info!("🔧 Turn {} running tool {}", turn_id, name);
                self.output.emit(Some(turn_id), OutputEvent::ToolStart(name));
            }
            None => {
                live.agent_done = true;
                self.feeder.feed("");
                log::debug!("🤖 Turn {} response finished, waiting for playback", turn_id);
            }
        }
    }

    fn complete(&mut self, live: LiveTurn) {
        let LiveTurn { turn, response, .. } = live;
        let text = response.text().to_string();

        if response.failed() {
            self.stats.turns_failed += 1;
        }
        if text.trim().is_empty() {
            log::warn!("🤖 Turn {} produced no response", turn.id);
        } else {
            self.responses.record_turn(&turn.input, &text);
        }
        self.output
            .emit(Some(turn.id), OutputEvent::AssistantComplete(text.clone()));
        self.stats.turns_completed += 1;

        let metrics = TurnMetrics {
            turn_id: turn.id,
            time_to_first_token: turn.first_token_at.map(|t| t - turn.started_at),
            time_to_first_audio: turn.playback_started_at.and_then(|started| {
                self.feeder
                    .state()
                    .first_audio_latency()
                    .map(|latency| started + latency - turn.started_at)
            }),
            total: turn.started_at.elapsed(),
            response_chars: text.chars().count(),
        };
        log::info!(
            "📊 Turn {} done in {:?} (first token {:?}, first audio {:?}, {} chars)",
            metrics.turn_id,
            metrics.total,
            metrics.time_to_first_token,
            metrics.time_to_first_audio,
            metrics.response_chars
        );
        self.last_metrics = Some(metrics);
        self.set_state(TurnState::Idle);
    }

    /// Tear down the live turn in a fixed order: silence playback, stop the
    /// agent, forget the partial answer, withdraw undelivered output.
    fn interrupt(&mut self, live: LiveTurn) {
        self.feeder.stop();
        live.response.cancel();
        let turn_id = live.turn.id;
        let spoken = live.response.text().chars().count();
        drop(live);
        self.output.clear_turn(turn_id);
        self.stats.turns_interrupted += 1;

        self.set_state(TurnState::Interrupted);
        log::info!("🛑 Turn {} interrupted after {} chars", turn_id, spoken);
        self.set_state(TurnState::Listening);
    }

    fn teardown(&mut self, live: &mut Option<LiveTurn>) {
        self.feeder.stop();
        if let Some(turn) = live.take() {
            turn.response.cancel();
            self.output.abandon_turn(turn.turn.id);
        }
        self.set_state(TurnState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_responding_and_speaking_are_live() {
        assert!(TurnState::Responding.is_live());
        assert!(TurnState::Speaking.is_live());
        assert!(!TurnState::Idle.is_live());
        assert!(!TurnState::Listening.is_live());
        assert!(!TurnState::Interrupted.is_live());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TurnState::Responding.to_string(), "responding");
        assert_eq!(TurnState::Interrupted.to_string(), "interrupted");
    }
}
