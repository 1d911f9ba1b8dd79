use super::playback::{PlaybackSession, PlaybackState, PlaybackStats};
use super::{PlaybackParams, SynthesisEngine, SynthesisEngineFactory, TtsError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

struct FeederInner {
    engine: Box<dyn SynthesisEngine>,
    session: PlaybackSession,
    /// Text was queued while nothing was playing
    unplayed: bool,
}

/// Feeds agent text into the TTS engine and controls playback.
///
/// Shared between the coordinator and the interruption hook, so every
/// method takes `&self`. The engine lock is never held across an await.
pub struct SpeechSynthesisFeeder {
    factory: Arc<dyn SynthesisEngineFactory>,
    params: PlaybackParams,
    state: Arc<PlaybackState>,
    inner: Mutex<FeederInner>,
    healthy: AtomicBool,
}

impl SpeechSynthesisFeeder {
    /// Create the first playback session. Failure here is fatal for the
    /// conversation.
    pub fn new(
        factory: Arc<dyn SynthesisEngineFactory>,
        params: PlaybackParams,
    ) -> Result<Self, TtsError> {
        let state = Arc::new(PlaybackState::new());
        let engine = factory.create(Arc::clone(&state))?;
        Ok(Self {
            factory,
            params,
            state,
            inner: Mutex::new(FeederInner {
                engine,
                session: PlaybackSession::new(0),
                unplayed: false,
            }),
            healthy: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FeederInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pass a fragment to the engine. The empty fragment ends the response
    /// and is always forwarded; it reports success regardless of engine state.
    pub fn feed(&self, fragment: &str) -> bool {
        let mut inner = self.lock();
        match inner.engine.feed(fragment) {
            Ok(()) => {
                inner.session.record_fed(fragment.chars().count());
                if !fragment.is_empty() && !self.state.is_active() {
                    inner.unplayed = true;
                }
                true
            }
            Err(e) => {
                log::warn!("🔊 TTS feed failed: {}", e);
                if e.is_terminal() {
                    self.recreate_locked(&mut inner);
                }
                fragment.is_empty()
            }
        }
    }

    /// Start audio generation from buffered text. No-op while already playing.
    pub fn start_playback(&self) -> bool {
        if self.state.is_active() {
            return true;
        }
        let mut inner = self.lock();
        match inner.engine.play_async(&self.params) {
            Ok(()) => {
                inner.session.record_started();
                inner.unplayed = false;
                true
            }
            Err(e) => {
                log::error!("🔊 Failed to start playback: {}", e);
                if e.is_terminal() {
                    self.recreate_locked(&mut inner);
                }
                false
            }
        }
    }

    /// Silence playback and discard queued text. Safe to call when idle.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if !self.state.is_active() && !inner.engine.is_playing() && !inner.unplayed {
            return;
        }
        inner.unplayed = false;
        let result = inner.engine.stop();
        self.state.mark_stopped();
        inner.session.record_stop();
        match result {
            Ok(()) => log::debug!("🔊 Playback stopped"),
            Err(e) if e.is_terminal() => {
                log::warn!("🔊 TTS engine unusable after stop: {}", e);
                self.recreate_locked(&mut inner);
            }
            Err(e) => log::warn!("🔊 TTS stop reported: {}", e),
        }
    }

    /// Replace the engine with a fresh instance.
    pub fn recreate(&self) -> Result<(), TtsError> {
        let mut inner = self.lock();
        self.try_recreate(&mut inner)
    }

    fn recreate_locked(&self, inner: &mut FeederInner) {
        if let Err(e) = self.try_recreate(inner) {
            log::error!("🔊 Could not recreate TTS engine: {}", e);
        }
    }

    fn try_recreate(&self, inner: &mut FeederInner) -> Result<(), TtsError> {
        let _ = inner.engine.stop();
        self.state.mark_stopped();
        match self.factory.create(Arc::clone(&self.state)) {
            Ok(engine) => {
                let recreations = inner.session.stats().recreations + 1;
                inner.engine = engine;
                inner.session = PlaybackSession::new(recreations);
                inner.unplayed = false;
                self.healthy.store(true, Ordering::Release);
                log::info!("🔊 TTS engine recreated ({} so far)", recreations);
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_active()
    }

    /// False once an engine could not be recreated.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Resolve when the current playback has been fully heard or stopped.
    pub async fn wait_drained(&self) {
        self.state.wait_drained().await;
    }

    pub fn state(&self) -> Arc<PlaybackState> {
        Arc::clone(&self.state)
    }

    pub fn params(&self) -> &PlaybackParams {
        &self.params
    }

    pub fn stats(&self) -> PlaybackStats {
        let mut inner = self.lock();
        inner.session.record_first_audio(self.state.first_audio_latency());
        inner.session.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Calls {
        fed: Mutex<Vec<String>>,
        stops: AtomicUsize,
        created: AtomicUsize,
        fail_stop: AtomicBool,
    }

    struct FakeEngine {
        calls: Arc<Calls>,
        state: Arc<PlaybackState>,
        generation: Option<u64>,
    }

    impl SynthesisEngine for FakeEngine {
        fn feed(&mut self, text: &str) -> Result<(), TtsError> {
            self.calls.fed.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn play_async(&mut self, _params: &PlaybackParams) -> Result<(), TtsError> {
            self.generation = self.state.mark_started();
            Ok(())
        }

        fn stop(&mut self) -> Result<(), TtsError> {
            self.calls.stops.fetch_add(1, Ordering::SeqCst);
            self.generation = None;
            if self.calls.fail_stop.swap(false, Ordering::SeqCst) {
                return Err(TtsError::Unrecoverable("socket gone".to_string()));
            }
            Ok(())
        }

        fn is_playing(&self) -> bool {
            self.generation.is_some()
        }
    }

    struct FakeFactory {
        calls: Arc<Calls>,
    }

    impl SynthesisEngineFactory for FakeFactory {
        fn create(&self, state: Arc<PlaybackState>) -> Result<Box<dyn SynthesisEngine>, TtsError> {
            self.calls.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeEngine {
                calls: Arc::clone(&self.calls),
                state,
                generation: None,
            }))
        }
    }

    fn feeder() -> (SpeechSynthesisFeeder, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let factory = Arc::new(FakeFactory {
            calls: Arc::clone(&calls),
        });
        let feeder = SpeechSynthesisFeeder::new(factory, PlaybackParams::default()).unwrap();
        (feeder, calls)
    }

    #[test]
    fn test_stop_when_idle_is_a_noop() {
        let (feeder, calls) = feeder();
        feeder.stop();
        feeder.stop();
        assert_eq!(calls.stops.load(Ordering::SeqCst), 0);
        assert!(!feeder.is_playing());
    }

    #[test]
    fn test_empty_fragment_is_forwarded() {
        let (feeder, calls) = feeder();
        assert!(feeder.feed(""));
        assert!(feeder.feed("Hello"));
        assert!(feeder.feed(""));
        assert_eq!(*calls.fed.lock().unwrap(), vec!["", "Hello", ""]);
        assert_eq!(feeder.stats().characters_fed, 5);
    }

    #[test]
    fn test_start_is_idempotent_and_stop_silences() {
        let (feeder, calls) = feeder();
        assert!(feeder.start_playback());
        assert!(feeder.start_playback());
        assert!(feeder.is_playing());
        assert_eq!(feeder.stats().playbacks_started, 1);

        feeder.stop();
        assert!(!feeder.is_playing());
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_stop_recreates_engine() {
        let (feeder, calls) = feeder();
        feeder.start_playback();
        calls.fail_stop.store(true, Ordering::SeqCst);
        feeder.stop();

        assert_eq!(calls.created.load(Ordering::SeqCst), 2);
        assert_eq!(feeder.stats().recreations, 1);
        assert!(feeder.is_healthy());
        assert!(!feeder.is_playing());
    }

    #[test]
    fn test_stop_discards_text_queued_while_idle() {
        let (feeder, calls) = feeder();
        feeder.feed("left over");
        feeder.stop();
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);

        feeder.stop();
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_drained_after_stop() {
        let (feeder, _calls) = feeder();
        feeder.start_playback();
        feeder.stop();
        feeder.wait_drained().await;
    }
}
