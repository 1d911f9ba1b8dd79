//! Live synthesis against ElevenLabs. Ignored unless built with `test-api`.

use async_trait::async_trait;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voice_agent_rs::{
    audio::{AudioError, AudioSink},
    tts::{ElevenLabsEngineFactory, PlaybackParams, SpeechSynthesisFeeder, TtsConfig},
};

#[derive(Default)]
struct CollectingSink {
    /// Oldest run still accepted, and the audio collected so far
    audio: Mutex<(u64, Vec<u8>)>,
    clears: AtomicUsize,
}

impl CollectingSink {
    fn collected(&self) -> usize {
        self.audio.lock().unwrap().1.len()
    }
}

#[async_trait]
impl AudioSink for CollectingSink {
    async fn write(&self, generation: u64, audio_data: &[u8]) -> Result<(), AudioError> {
        let mut audio = self.audio.lock().unwrap();
        if generation >= audio.0 {
            audio.1.extend_from_slice(audio_data);
        }
        Ok(())
    }

    fn clear(&self, generation: u64) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        let mut audio = self.audio.lock().unwrap();
        audio.0 = audio.0.max(generation);
        audio.1.clear();
    }

    async fn drain(&self) {}
}

fn feeder(sink: Arc<CollectingSink>) -> Option<SpeechSynthesisFeeder> {
    let Ok(key) = env::var("ELEVENLABS_API_KEY") else {
        println!("ELEVENLABS_API_KEY not set, skipping integration test");
        return None;
    };
    let factory = Arc::new(ElevenLabsEngineFactory::new(key, TtsConfig::default(), sink));
    Some(SpeechSynthesisFeeder::new(factory, PlaybackParams::default()).expect("Failed to create feeder"))
}

#[tokio::test]
#[cfg_attr(
    not(feature = "test-api"),
    ignore = "requires API key - run with --features test-api"
)]
async fn test_streamed_fragments_are_synthesized() {
    let sink = Arc::new(CollectingSink::default());
    let Some(feeder) = feeder(Arc::clone(&sink)) else {
        return;
    };

    assert!(feeder.feed("Hello there,"));
    assert!(feeder.start_playback());
    assert!(feeder.feed(" this is a streaming test."));
    assert!(feeder.feed(""));

    tokio::time::timeout(Duration::from_secs(30), feeder.wait_drained())
        .await
        .expect("playback never finished");

    let audio = sink.collected();
    println!("Received {} bytes of audio", audio);
    assert!(audio > 0);
    assert_eq!(audio % 2, 0, "PCM16 must be whole samples");
    assert!(feeder.stats().last_first_audio_latency.is_some());
}

#[tokio::test]
#[cfg_attr(
    not(feature = "test-api"),
    ignore = "requires API key - run with --features test-api"
)]
async fn test_stop_mid_playback() {
    let sink = Arc::new(CollectingSink::default());
    let Some(feeder) = feeder(Arc::clone(&sink)) else {
        return;
    };

    feeder.feed("This sentence is long enough that it will still be playing when we stop it, and then some more words follow.");
    feeder.start_playback();
    tokio::time::timeout(Duration::from_secs(30), async {
        while sink.collected() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no audio arrived");

    feeder.stop();
    assert!(!feeder.is_playing());
    assert!(sink.clears.load(Ordering::SeqCst) >= 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.collected(), 0, "audio of the stopped run arrived late");

    // The session is reusable after a stop
    feeder.feed("Second try.");
    assert!(feeder.start_playback());
    feeder.feed("");
    tokio::time::timeout(Duration::from_secs(30), feeder.wait_drained())
        .await
        .expect("second playback never finished");
}
