//! Wiring of one conversation: engines, recognition worker and coordinator.

use crate::agent::AgentCapability;
use crate::audio::{AudioChannelAdapter, AudioReceiver, AudioSink};
use crate::config::{ApiConfig, SessionConfig};
use crate::coordinator::{CoordinatorStats, Interrupter, SessionEnd, TurnCoordinator, TurnState};
use crate::error::{Result, VoiceError};
use crate::llm::{create_chat_model, create_default_registry, ToolCallingAgent};
use crate::output::SessionOutput;
use crate::stt::{
    FireworksEngineFactory, InterruptHook, RecognitionStats, SpeechEngine, SpeechEngineFactory,
    SpeechRecognitionStream,
};
use crate::tts::{
    ElevenLabsEngineFactory, PlaybackStats, SpeechSynthesisFeeder, SynthesisEngineFactory,
    TtsConfig,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "local-audio")]
use crate::audio::capture::MicrophoneCapture;

/// The engines a conversation runs on
pub struct SessionEngines {
    pub stt: Arc<dyn SpeechEngineFactory>,
    pub tts: Arc<dyn SynthesisEngineFactory>,
    pub agent: Arc<dyn AgentCapability>,
}

/// Builds the engines for each new conversation. Synthesized audio of that
/// conversation goes to `audio_sink`.
pub trait EngineProvider: Send + Sync {
    fn engines(&self, audio_sink: Arc<dyn AudioSink>) -> Result<SessionEngines>;
}

/// Fireworks for recognition, ElevenLabs for synthesis and a tool-calling
/// agent on the configured LLM provider. The agent is shared by all
/// conversations; each keeps its own history.
pub struct HostedEngines {
    api: ApiConfig,
    tts: TtsConfig,
    agent: Arc<dyn AgentCapability>,
}

impl HostedEngines {
    pub fn new(api: ApiConfig, config: &SessionConfig) -> Result<Self> {
        let model = create_chat_model(&config.llm, &api)?;
        let agent = Arc::new(ToolCallingAgent::new(model, create_default_registry()));
        Ok(Self {
            api,
            tts: config.tts.clone(),
            agent,
        })
    }
}

impl EngineProvider for HostedEngines {
    fn engines(&self, audio_sink: Arc<dyn AudioSink>) -> Result<SessionEngines> {
        Ok(SessionEngines {
            stt: Arc::new(FireworksEngineFactory::new(self.api.fireworks_key())),
            tts: Arc::new(ElevenLabsEngineFactory::new(
                self.api.elevenlabs_key(),
                self.tts.clone(),
                audio_sink,
            )),
            agent: Arc::clone(&self.agent),
        })
    }
}

/// Summary of a finished conversation
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub turns: CoordinatorStats,
    pub history_turns: usize,
    pub recognition: RecognitionStats,
    pub playback: PlaybackStats,
}

pub struct VoiceSession;

impl VoiceSession {
    /// Build and start a conversation. Engine initialization failures are
    /// returned here and nothing is left running.
    pub fn start(
        config: SessionConfig,
        engines: SessionEngines,
        output: Arc<dyn SessionOutput>,
    ) -> Result<SessionHandle> {
        config.validate()?;

        let feeder = Arc::new(SpeechSynthesisFeeder::new(engines.tts, config.playback.clone())?);
        log::info!("🔊 Speech synthesis ready");

        let hook: InterruptHook = {
            let feeder = Arc::clone(&feeder);
            Arc::new(move || feeder.stop())
        };
        let (mut recognition, callbacks) =
            SpeechRecognitionStream::new(&config.recognition, Some(hook));
        let engine = engines.stt.initialize(&config.recognition, callbacks)?;
        log::info!("🎤 Speech recognition ready");

        let (adapter, audio_rx) = AudioChannelAdapter::new(config.audio_queue_capacity);
        let adapter = Arc::new(adapter);
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(recognition_worker(engine, audio_rx, shutdown.child_token()));

        let mut coordinator = TurnCoordinator::new(engines.agent, Arc::clone(&feeder), output, config);
        let info = coordinator.agent_info();
        log::info!(
            "🤖 Agent: {} / {} (temperature {}, tools: {})",
            info.provider,
            info.model,
            info.temperature,
            info.tool_names.join(", ")
        );
        let interrupter = coordinator.interrupter();
        let state = coordinator.subscribe();

        let coordinator_shutdown = shutdown.clone();
        let coordinator_feeder = Arc::clone(&feeder);
        let coordinator = tokio::spawn(async move {
            let end = coordinator
                .run(&mut recognition, coordinator_shutdown.clone())
                .await;
            log::info!("Conversation ended: {:?}", end);
            coordinator_shutdown.cancel();
            SessionReport {
                end,
                turns: coordinator.stats(),
                history_turns: coordinator.history().turns(),
                recognition: recognition.stats().clone(),
                playback: coordinator_feeder.stats(),
            }
        });

        Ok(SessionHandle {
            adapter,
            feeder,
            interrupter,
            state,
            shutdown,
            worker,
            coordinator,
            #[cfg(feature = "local-audio")]
            capture: None,
        })
    }
}

/// Pushes canonical audio into the STT engine until shut down or the audio
/// source closes.
async fn recognition_worker(
    mut engine: Box<dyn SpeechEngine>,
    mut audio: AudioReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            chunk = audio.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            log::info!("🎤 Audio source closed");
            break;
        };
        if let Err(e) = engine.feed_audio(&chunk).await {
            if e.is_fatal() {
                log::error!("🎤 Recognition engine failed: {}", e);
                break;
            }
            log::warn!("🎤 Dropped audio chunk: {}", e);
        }
    }
    engine.shutdown().await;
}

/// Control surface of a running conversation
pub struct SessionHandle {
    adapter: Arc<AudioChannelAdapter>,
    feeder: Arc<SpeechSynthesisFeeder>,
    interrupter: Interrupter,
    state: watch::Receiver<TurnState>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
    coordinator: JoinHandle<SessionReport>,
    #[cfg(feature = "local-audio")]
    capture: Option<MicrophoneCapture>,
}

impl SessionHandle {
    /// Where raw audio for this conversation goes
    pub fn adapter(&self) -> Arc<AudioChannelAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn submit_audio(&self, bytes: &[u8], source_rate: u32, source_channels: u16) {
        self.adapter.submit_chunk(bytes, source_rate, source_channels);
    }

    /// No more audio will arrive; pending audio is still recognized.
    pub fn close_audio(&self) {
        self.adapter.close();
    }

    /// Stop speaking and drop the live turn, as if the user started talking.
    pub fn interrupt(&self) {
        log::info!("🛑 Interrupt requested");
        self.interrupter.interrupt();
    }

    pub fn state(&self) -> watch::Receiver<TurnState> {
        self.state.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.feeder.is_playing()
    }

    #[cfg(feature = "local-audio")]
    pub fn attach_capture(&mut self, capture: MicrophoneCapture) {
        self.capture = Some(capture);
    }

    /// Resolve once the conversation has ended on its own or was shut down.
    pub async fn ended(&self) {
        self.shutdown.cancelled().await;
    }

    /// Cancel everything, stop speech and wait until every task and the
    /// capture thread have finished.
    pub async fn shutdown(self) -> Result<SessionReport> {
        let SessionHandle {
            adapter,
            feeder,
            shutdown,
            worker,
            coordinator,
            #[cfg(feature = "local-audio")]
            capture,
            ..
        } = self;

        shutdown.cancel();
        feeder.stop();
        adapter.close();

        worker
            .await
            .map_err(|e| VoiceError::Session(format!("recognition worker failed: {}", e)))?;

        #[cfg(feature = "local-audio")]
        if let Some(capture) = capture {
            tokio::task::spawn_blocking(move || capture.shutdown())
                .await
                .map_err(|e| VoiceError::Session(format!("capture shutdown failed: {}", e)))?;
            log::info!("🎤 Capture thread stopped");
        }

        let report = coordinator
            .await
            .map_err(|e| VoiceError::Session(format!("coordinator failed: {}", e)))?;
        log::info!(
            "Session closed: {} turns completed, {} interrupted",
            report.turns.turns_completed,
            report.turns.turns_interrupted
        );
        Ok(report)
    }
}
