use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voice_agent_rs::{
    config::{load_config, SessionConfig},
    llm::LlmProvider,
    protocol::AudioEncoding,
    server::{ServerConfig, VoiceServer},
    session::HostedEngines,
    stt::{FireworksEngineFactory, RecognitionEvent, SpeechEngineFactory, SpeechRecognitionStream},
    SAMPLE_RATE,
};

#[derive(Parser, Debug)]
#[command(name = "voice-agent", version, about = "Interruptible streaming voice agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Talk to the agent through the local microphone and speaker
    Listen(SessionArgs),
    /// Serve conversations over websocket
    Serve {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// How synthesized audio is sent to clients
        #[arg(long, value_enum, default_value_t = AudioEncoding::Binary)]
        audio_encoding: AudioEncoding,
    },
    /// Print the transcript of a WAV file
    Transcribe {
        file: PathBuf,
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    #[arg(long, value_enum, default_value_t = LlmProvider::Groq)]
    provider: LlmProvider,
    /// Provider default when omitted
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,
    /// ElevenLabs voice id
    #[arg(long)]
    voice: Option<String>,
    /// Speech rate, 0.7 to 1.2
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    /// Completed turns kept as context
    #[arg(long, default_value_t = 3)]
    history_turns: usize,
    /// Silence that ends an utterance, in milliseconds
    #[arg(long, default_value_t = 400)]
    silence_ms: u64,
    /// Wait for the engine's final transcript instead of promoting partials
    #[arg(long)]
    no_early_transcription: bool,
}

impl SessionArgs {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.max_history_turns = self.history_turns;
        config.llm.provider = self.provider;
        config.llm.model = self.model.clone();
        config.llm.temperature = self.temperature;
        if let Some(voice) = &self.voice {
            config.tts.voice_id = voice.clone();
        }
        config.tts.speed = self.speed;
        let sensitivity = &mut config.recognition.sensitivity;
        sensitivity.post_speech_silence = Duration::from_millis(self.silence_ms);
        sensitivity.early_transcription_enabled = !self.no_early_transcription;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    log::info!("🚀 Starting voice agent");

    let cli = Cli::parse();
    match cli.command {
        Command::Listen(session) => listen(session).await,
        Command::Serve {
            session,
            host,
            port,
            audio_encoding,
        } => {
            let server_config = ServerConfig {
                host,
                port,
                audio_encoding,
                ..ServerConfig::default()
            };
            serve(session, server_config).await
        }
        Command::Transcribe { file, session } => transcribe(file, session).await,
    }
}

#[cfg(feature = "local-audio")]
async fn listen(args: SessionArgs) -> Result<()> {
    use voice_agent_rs::audio::capture::{CaptureConfig, MicrophoneCapture};
    use voice_agent_rs::audio::sink::{CpalConfig, CpalSink};
    use voice_agent_rs::output::ConsoleOutput;
    use voice_agent_rs::session::{EngineProvider, VoiceSession};

    let config = args.session_config();
    let api = load_config(config.llm.provider)?;
    let provider = HostedEngines::new(api, &config)?;

    let speaker = Arc::new(CpalSink::new(CpalConfig::default()).context("speaker unavailable")?);
    let engines = provider.engines(speaker)?;
    let mut session = VoiceSession::start(config, engines, Arc::new(ConsoleOutput::default()))?;

    let capture = MicrophoneCapture::start(CaptureConfig::default(), session.adapter())
        .context("microphone unavailable")?;
    log::info!(
        "🎤 Capturing at {} Hz, {} channel(s)",
        capture.sample_rate(),
        capture.channels()
    );
    session.attach_capture(capture);

    println!("🎧 Listening. Say \"goodbye\" or press Ctrl+C to exit.");
    tokio::select! {
        _ = session.ended() => {}
        _ = tokio::signal::ctrl_c() => log::info!("🛑 Received Ctrl+C, shutting down..."),
    }

    let report = session.shutdown().await?;
    log::info!("📊 Session report: {:?}", report);
    println!("\n👋 Goodbye!");
    Ok(())
}

#[cfg(not(feature = "local-audio"))]
async fn listen(_args: SessionArgs) -> Result<()> {
    anyhow::bail!("built without local audio; rebuild with --features local-audio")
}

async fn serve(args: SessionArgs, server_config: ServerConfig) -> Result<()> {
    let config = args.session_config();
    config.validate()?;
    let api = load_config(config.llm.provider)?;
    let provider = Arc::new(HostedEngines::new(api, &config)?);
    let server = VoiceServer::new(server_config, config, provider);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 Received Ctrl+C, shutting down...");
            signal.cancel();
        }
    });

    server.run(shutdown).await?;
    println!("👋 Goodbye!");
    Ok(())
}

/// Seconds of silence appended so the last utterance is closed by the VAD.
const TRAILING_SILENCE_SECS: u32 = 2;

async fn transcribe(path: PathBuf, args: SessionArgs) -> Result<()> {
    let config = args.session_config();
    // Only the recognition key is used here
    let api = load_config(LlmProvider::Ollama)?;

    let reader = hound::WavReader::open(&path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let wav = reader.spec();
    if wav.bits_per_sample != 16 || wav.sample_format != hound::SampleFormat::Int {
        anyhow::bail!("{} is not 16-bit PCM", path.display());
    }
    let mut samples = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("cannot read samples")?;
    samples.extend(std::iter::repeat(0).take(
        (wav.sample_rate * TRAILING_SILENCE_SECS) as usize * wav.channels as usize,
    ));
    log::info!(
        "🎤 Transcribing {} ({} Hz, {} channel(s))",
        path.display(),
        wav.sample_rate,
        wav.channels
    );

    let (adapter, mut audio) =
        voice_agent_rs::audio::AudioChannelAdapter::new(config.audio_queue_capacity);
    let (mut recognition, callbacks) = SpeechRecognitionStream::new(&config.recognition, None);
    let mut engine = FireworksEngineFactory::new(api.fireworks_key())
        .initialize(&config.recognition, callbacks)?;

    // 100 ms of source audio per chunk
    let chunk_len = (wav.sample_rate / 10) as usize * wav.channels as usize;
    let feeder = tokio::spawn(async move {
        for chunk in samples.chunks(chunk_len.max(1)) {
            let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
            adapter.submit_chunk(&bytes, wav.sample_rate, wav.channels);
            while let Some(canonical) = audio.try_recv() {
                engine.feed_audio(&canonical).await?;
                // Pace at real time so silence timing matches the recording
                let secs = canonical.len() as f64 / SAMPLE_RATE as f64;
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            }
        }
        adapter.close();
        engine.shutdown().await;
        Ok::<_, voice_agent_rs::stt::SttError>(())
    });

    while let Some(event) = recognition.next_event().await {
        match event {
            RecognitionEvent::Partial(text) => log::debug!("🎤 Partial: {}", text),
            RecognitionEvent::Final(utterance) => println!("{}", utterance.text()),
            RecognitionEvent::RecordingStart => {}
        }
    }
    feeder.await.context("audio feeder panicked")??;
    Ok(())
}
