use super::{
    insert_pauses, PlaybackParams, PlaybackState, SynthesisEngine, SynthesisEngineFactory,
    TtsConfig, TtsError,
};
use crate::audio::sink::AudioSink;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

const API_BASE: &str = "wss://api.elevenlabs.io/v1/text-to-speech";
const OUTPUT_FORMAT: &str = "pcm_16000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResponse {
    audio: Option<String>,
    is_final: Option<bool>,
    message: Option<String>,
    error: Option<String>,
}

/// One decoded server message
#[derive(Debug, Default, PartialEq)]
struct StreamUpdate {
    audio: Option<Vec<u8>>,
    is_final: bool,
}

fn parse_message(text: &str) -> Result<StreamUpdate, TtsError> {
    let response: StreamResponse =
        serde_json::from_str(text).map_err(|e| TtsError::Decode(format!("invalid JSON: {}", e)))?;
    if let Some(error) = response.error {
        let message = response.message.unwrap_or_default();
        return Err(TtsError::ApiError {
            message: format!("{} {}", error, message).trim().to_string(),
        });
    }
    let audio = match response.audio {
        Some(encoded) if !encoded.is_empty() => Some(
            BASE64
                .decode(encoded)
                .map_err(|e| TtsError::Decode(e.to_string()))?,
        ),
        _ => None,
    };
    Ok(StreamUpdate {
        audio,
        is_final: response.is_final.unwrap_or(false),
    })
}

/// Holds audio back until enough is buffered to play without gaps.
#[derive(Debug)]
struct AudioPrebuffer {
    threshold: usize,
    buffered: Vec<u8>,
    released: bool,
}

impl AudioPrebuffer {
    fn new(threshold: usize) -> Self {
        Self {
            threshold,
            buffered: Vec::new(),
            released: threshold == 0,
        }
    }

    /// Returns audio that should be written now.
    fn push(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        if self.released {
            return Some(chunk);
        }
        self.buffered.extend_from_slice(&chunk);
        if self.buffered.len() >= self.threshold {
            self.released = true;
            return Some(std::mem::take(&mut self.buffered));
        }
        None
    }

    /// Whatever is still held once the stream ends.
    fn finish(&mut self) -> Option<Vec<u8>> {
        self.released = true;
        if self.buffered.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffered))
        }
    }
}

fn threshold_bytes(params: &PlaybackParams) -> usize {
    let samples = params.buffer_threshold.as_secs_f64() * crate::SAMPLE_RATE as f64;
    samples as usize * 2
}

#[derive(Debug)]
enum StreamInput {
    Text(String),
    End,
}

struct ActiveStream {
    text_tx: mpsc::UnboundedSender<StreamInput>,
    task: JoinHandle<()>,
    generation: u64,
    input_closed: bool,
}

pub struct ElevenLabsEngineFactory {
    api_key: String,
    config: TtsConfig,
    sink: Arc<dyn AudioSink>,
}

impl ElevenLabsEngineFactory {
    pub fn new(api_key: impl Into<String>, config: TtsConfig, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            sink,
        }
    }
}

impl SynthesisEngineFactory for ElevenLabsEngineFactory {
    fn create(&self, state: Arc<PlaybackState>) -> Result<Box<dyn SynthesisEngine>, TtsError> {
        if self.api_key.trim().is_empty() {
            return Err(TtsError::Initialization(
                "ElevenLabs API key is empty".to_string(),
            ));
        }
        let engine = ElevenLabsEngine::new(
            self.api_key.clone(),
            self.config.clone(),
            Arc::clone(&self.sink),
            state,
        )?;
        Ok(Box::new(engine))
    }
}

/// Streams text to the ElevenLabs `stream-input` websocket and writes the
/// returned PCM to an audio sink. One websocket per response.
pub struct ElevenLabsEngine {
    api_key: String,
    url: Url,
    config: TtsConfig,
    sink: Arc<dyn AudioSink>,
    state: Arc<PlaybackState>,
    params: PlaybackParams,
    pending: String,
    first_sent: bool,
    end_requested: bool,
    stream: Option<ActiveStream>,
}

impl ElevenLabsEngine {
    pub fn new(
        api_key: String,
        config: TtsConfig,
        sink: Arc<dyn AudioSink>,
        state: Arc<PlaybackState>,
    ) -> Result<Self, TtsError> {
        let url = build_stream_url(&config)?;
        log::info!(
            "🔊 ElevenLabs engine ready (voice {}, model {}, speed {})",
            config.voice_id,
            config.model,
            config.speed
        );
        Ok(Self {
            api_key,
            url,
            config,
            sink,
            state,
            params: PlaybackParams::default(),
            pending: String::new(),
            first_sent: false,
            end_requested: false,
            stream: None,
        })
    }

    fn open_message(&self) -> Value {
        json!({
            "text": " ",
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
                "speed": self.config.speed,
            },
            "xi_api_key": self.api_key,
        })
    }

    /// The stream that still accepts text, dropping one that has finished.
    fn open_stream(&mut self) -> Option<&ActiveStream> {
        if self.stream.as_ref().is_some_and(|s| s.task.is_finished()) {
            self.stream = None;
        }
        self.stream.as_ref().filter(|s| !s.input_closed)
    }

    /// Send buffered text once enough has accumulated, or everything when
    /// the response has ended.
    fn flush_pending(&mut self) -> Result<(), TtsError> {
        let ending = self.end_requested;
        let ready = self.first_sent
            || ending
            || self.pending.chars().count() >= self.params.min_first_fragment_len;
        if !ready {
            return Ok(());
        }
        let Some(stream) = self.open_stream() else {
            return Ok(());
        };
        let text_tx = stream.text_tx.clone();

        if !self.pending.trim().is_empty() {
            let text = insert_pauses(&std::mem::take(&mut self.pending), &self.params);
            text_tx
                .send(StreamInput::Text(text))
                .map_err(|_| TtsError::Closed)?;
            self.first_sent = true;
        } else {
            self.pending.clear();
        }

        if ending {
            text_tx.send(StreamInput::End).map_err(|_| TtsError::Closed)?;
            self.end_requested = false;
            self.first_sent = false;
            if let Some(stream) = self.stream.as_mut() {
                stream.input_closed = true;
            }
        }
        Ok(())
    }

    fn reset_text(&mut self) {
        self.pending.clear();
        self.first_sent = false;
        self.end_requested = false;
    }
}

impl SynthesisEngine for ElevenLabsEngine {
    fn feed(&mut self, text: &str) -> Result<(), TtsError> {
        if text.is_empty() {
            // Nothing buffered and nothing streaming: the response was empty
            if self.pending.is_empty() && self.open_stream().is_none() {
                return Ok(());
            }
            self.end_requested = true;
        } else {
            self.pending.push_str(text);
        }
        self.flush_pending()
    }

    fn play_async(&mut self, params: &PlaybackParams) -> Result<(), TtsError> {
        if self.open_stream().is_some() {
            return Ok(());
        }
        let handle = Handle::try_current()
            .map_err(|e| TtsError::Initialization(format!("no async runtime: {}", e)))?;
        let Some(generation) = self.state.mark_started() else {
            log::debug!("🔊 Playback already active");
            return Ok(());
        };

        self.params = params.clone();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let task = handle.spawn(run_stream(
            self.url.clone(),
            self.open_message(),
            text_rx,
            Arc::clone(&self.sink),
            Arc::clone(&self.state),
            generation,
            threshold_bytes(params),
        ));
        self.stream = Some(ActiveStream {
            text_tx,
            task,
            generation,
            input_closed: false,
        });
        log::debug!("🔊 Playback {} started", generation);
        self.flush_pending()
    }

    fn stop(&mut self) -> Result<(), TtsError> {
        let was_active = self.state.is_active();
        self.reset_text();
        let died = match self.stream.take() {
            Some(stream) => {
                let died = stream.task.is_finished() && stream.generation == self.state.generation();
                stream.task.abort();
                died
            }
            None => false,
        };
        // Invalidate the run before clearing, so audio still in flight is refused
        self.state.mark_stopped();
        self.sink.clear(self.state.generation());

        if was_active && died {
            return Err(TtsError::Unrecoverable(
                "stream task exited while playback was active".to_string(),
            ));
        }
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.stream
            .as_ref()
            .map(|stream| !stream.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ElevenLabsEngine {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.task.abort();
        }
    }
}

fn build_stream_url(config: &TtsConfig) -> Result<Url, TtsError> {
    let mut url = Url::parse(&format!("{}/{}/stream-input", API_BASE, config.voice_id))
        .map_err(|e| TtsError::Initialization(format!("invalid voice id: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("model_id", &config.model)
        .append_pair("output_format", OUTPUT_FORMAT);
    Ok(url)
}

async fn run_stream(
    url: Url,
    open_message: Value,
    mut text_rx: mpsc::UnboundedReceiver<StreamInput>,
    sink: Arc<dyn AudioSink>,
    state: Arc<PlaybackState>,
    generation: u64,
    threshold: usize,
) {
    match stream_audio(&url, open_message, &mut text_rx, &sink, &state, generation, threshold).await {
        Ok(bytes) => log::debug!("🔊 Playback {} streamed {} bytes", generation, bytes),
        Err(e) => log::error!("🔊 ElevenLabs stream failed: {}", e),
    }
    if state.generation() == generation {
        sink.drain().await;
    }
    state.mark_finished(generation);
}

async fn write_audio(
    sink: &Arc<dyn AudioSink>,
    state: &PlaybackState,
    generation: u64,
    pcm: &[u8],
) -> Result<bool, TtsError> {
    if state.generation() != generation {
        return Ok(false);
    }
    if state.mark_first_audio(generation) {
        if let Some(latency) = state.first_audio_latency() {
            log::info!("🔊 First audio after {:?}", latency);
        }
    }
    sink.write(generation, pcm).await?;
    Ok(true)
}

async fn stream_audio(
    url: &Url,
    open_message: Value,
    text_rx: &mut mpsc::UnboundedReceiver<StreamInput>,
    sink: &Arc<dyn AudioSink>,
    state: &PlaybackState,
    generation: u64,
    threshold: usize,
) -> Result<usize, TtsError> {
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();
    write.send(Message::Text(open_message.to_string().into())).await?;

    let mut prebuffer = AudioPrebuffer::new(threshold);
    let mut input_open = true;
    let mut bytes = 0usize;

    loop {
        tokio::select! {
            input = text_rx.recv(), if input_open => {
                match input {
                    Some(StreamInput::Text(text)) => {
                        let message = json!({"text": text, "try_trigger_generation": true});
                        write.send(Message::Text(message.to_string().into())).await?;
                    }
                    Some(StreamInput::End) | None => {
                        input_open = false;
                        write.send(Message::Text(json!({"text": ""}).to_string().into())).await?;
                    }
                }
            }
            message = read.next() => {
                let Some(message) = message else {
                    break;
                };
                match message? {
                    Message::Text(text) => {
                        let update = parse_message(text.as_str())?;
                        if let Some(audio) = update.audio {
                            bytes += audio.len();
                            if let Some(ready) = prebuffer.push(audio) {
                                if !write_audio(sink, state, generation, &ready).await? {
                                    return Ok(bytes);
                                }
                            }
                        }
                        if update.is_final {
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        log::debug!("🔊 Server closed connection: {:?}", frame);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(rest) = prebuffer.finish() {
        write_audio(sink, state, generation, &rest).await?;
    }
    let _ = write.close().await;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioError;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSink {
        clears: AtomicUsize,
        floor: AtomicU64,
    }

    #[async_trait::async_trait]
    impl AudioSink for CountingSink {
        async fn write(&self, _generation: u64, _audio_data: &[u8]) -> Result<(), AudioError> {
            Ok(())
        }

        fn clear(&self, generation: u64) {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.floor.store(generation, Ordering::SeqCst);
        }

        async fn drain(&self) {}
    }

    fn engine(sink: Arc<CountingSink>) -> ElevenLabsEngine {
        ElevenLabsEngine::new(
            "key".to_string(),
            TtsConfig::default(),
            sink,
            Arc::new(PlaybackState::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_stream_url() {
        let url = build_stream_url(&TtsConfig::default()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.elevenlabs.io/v1/text-to-speech/21m00Tcm4TlvDq8ikWAM/stream-input?model_id=eleven_flash_v2_5&output_format=pcm_16000"
        );
    }

    #[test]
    fn test_open_message_carries_voice_settings() {
        let engine = engine(Arc::new(CountingSink::default()));
        let message = engine.open_message();
        assert_eq!(message["text"], " ");
        assert_eq!(message["xi_api_key"], "key");
        assert_eq!(message["voice_settings"]["speed"], 1.0);
    }

    #[test]
    fn test_parse_audio_and_final() {
        let encoded = BASE64.encode([1u8, 2, 3, 4]);
        let update = parse_message(&format!(r#"{{"audio":"{}","isFinal":null}}"#, encoded)).unwrap();
        assert_eq!(update.audio, Some(vec![1, 2, 3, 4]));
        assert!(!update.is_final);

        let update = parse_message(r#"{"audio":null,"isFinal":true}"#).unwrap();
        assert_eq!(update, StreamUpdate { audio: None, is_final: true });
    }

    #[test]
    fn test_parse_error_message() {
        let err = parse_message(r#"{"error":"quota_exceeded","message":"out of credits"}"#).unwrap_err();
        assert!(matches!(err, TtsError::ApiError { .. }));
        assert!(matches!(parse_message("not json"), Err(TtsError::Decode(_))));
    }

    #[test]
    fn test_prebuffer_releases_at_threshold() {
        let mut prebuffer = AudioPrebuffer::new(6);
        assert_eq!(prebuffer.push(vec![0; 4]), None);
        assert_eq!(prebuffer.push(vec![1; 4]).map(|b| b.len()), Some(8));
        assert_eq!(prebuffer.push(vec![2; 2]), Some(vec![2, 2]));
        assert_eq!(prebuffer.finish(), None);

        let mut short = AudioPrebuffer::new(100);
        assert_eq!(short.push(vec![0; 10]), None);
        assert_eq!(short.finish().map(|b| b.len()), Some(10));
    }

    #[test]
    fn test_threshold_in_bytes() {
        let params = PlaybackParams {
            buffer_threshold: Duration::from_millis(500),
            ..PlaybackParams::default()
        };
        assert_eq!(threshold_bytes(&params), 16000);
    }

    #[test]
    fn test_text_waits_for_playback() {
        let mut engine = engine(Arc::new(CountingSink::default()));
        engine.feed("Hello").unwrap();
        engine.feed(" there").unwrap();
        engine.feed("").unwrap();
        assert_eq!(engine.pending, "Hello there");
        assert!(engine.end_requested);
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_end_of_empty_response_is_not_carried_over() {
        let mut engine = engine(Arc::new(CountingSink::default()));
        engine.feed("").unwrap();
        assert!(!engine.end_requested);
        engine.feed("Next answer").unwrap();
        assert!(!engine.end_requested);
    }

    #[test]
    fn test_play_without_runtime_fails_cleanly() {
        let mut engine = engine(Arc::new(CountingSink::default()));
        let err = engine.play_async(&PlaybackParams::default()).unwrap_err();
        assert!(matches!(err, TtsError::Initialization(_)));
        assert!(!engine.state.is_active());
    }

    #[test]
    fn test_stop_clears_text_and_sink() {
        let sink = Arc::new(CountingSink::default());
        let mut engine = engine(Arc::clone(&sink));
        engine.feed("half a sentence").unwrap();
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert!(engine.pending.is_empty());
        assert_eq!(sink.clears.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_clears_sink_past_the_stopped_run() {
        let sink = Arc::new(CountingSink::default());
        let mut engine = engine(Arc::clone(&sink));
        let run = engine.state.mark_started().unwrap();
        engine.stop().unwrap();

        // The sink refuses the stopped run, but not the next one
        let floor = sink.floor.load(Ordering::SeqCst);
        assert!(floor > run);
        assert_eq!(floor, engine.state.generation());
        assert!(engine.state.mark_started().unwrap() >= floor);
    }

    #[tokio::test]
    async fn test_audio_in_flight_at_stop_is_not_delivered() {
        use crate::audio::OutputAudioSink;
        use crate::output::{OutputQueue, SessionOutput};

        let queue = Arc::new(OutputQueue::new(16));
        let output: Arc<dyn SessionOutput> = queue.clone();
        let sink: Arc<dyn AudioSink> = Arc::new(OutputAudioSink::new(output));
        let state = Arc::new(PlaybackState::new());
        let mut engine = ElevenLabsEngine::new(
            "key".to_string(),
            TtsConfig::default(),
            Arc::clone(&sink),
            Arc::clone(&state),
        )
        .unwrap();

        let run = state.mark_started().unwrap();
        assert!(write_audio(&sink, &state, run, &[1, 2]).await.unwrap());
        engine.stop().unwrap();

        // The stream task checked its run just before the stop and writes after it
        sink.write(run, &[3, 4]).await.unwrap();
        assert!(!write_audio(&sink, &state, run, &[5, 6]).await.unwrap());

        queue.close();
        assert_eq!(queue.recv().await, None);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let factory = ElevenLabsEngineFactory::new(
            " ",
            TtsConfig::default(),
            Arc::new(CountingSink::default()),
        );
        let result = factory.create(Arc::new(PlaybackState::new()));
        assert!(matches!(result, Err(TtsError::Initialization(_))));
    }
}
