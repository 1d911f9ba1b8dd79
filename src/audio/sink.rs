use super::AudioError;
use crate::output::SessionOutput;
use std::sync::Arc;

/// Where synthesized speech ends up. Audio is 16-bit PCM at 16 kHz mono.
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue audio of playback run `generation`. Audio of a run older than
    /// the last `clear` is discarded, and the check is atomic with the enqueue.
    async fn write(&self, generation: u64, audio_data: &[u8]) -> Result<(), AudioError>;

    /// Drop everything queued but not yet heard, and refuse later writes from
    /// runs before `generation`. Must not block.
    fn clear(&self, generation: u64);

    /// Resolve once everything written so far has been played out.
    async fn drain(&self);
}

/// Sends synthesized audio to the conversation's output surface, for
/// sessions where the client does its own playback.
pub struct OutputAudioSink {
    output: Arc<dyn SessionOutput>,
}

impl OutputAudioSink {
    pub fn new(output: Arc<dyn SessionOutput>) -> Self {
        Self { output }
    }
}

#[async_trait::async_trait]
impl AudioSink for OutputAudioSink {
    async fn write(&self, generation: u64, audio_data: &[u8]) -> Result<(), AudioError> {
        self.output.emit_audio(generation, audio_data.to_vec());
        Ok(())
    }

    fn clear(&self, generation: u64) {
        self.output.clear_audio(generation);
    }

    async fn drain(&self) {
        self.output.audio_flushed().await;
    }
}

#[cfg(feature = "local-audio")]
pub use cpal_sink::{CpalConfig, CpalSink};

#[cfg(feature = "local-audio")]
mod cpal_sink {
    use super::{AudioError, AudioSink};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::mpsc::{channel, Sender};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::thread;
    use std::time::Duration;

    pub struct CpalConfig {
        /// Most audio the sink will hold, in milliseconds
        pub buffer_size_ms: u32,
        /// Warning threshold for a nearly full buffer (percentage)
        pub high_buffer_warning: u8,
    }

    impl Default for CpalConfig {
        fn default() -> Self {
            Self {
                buffer_size_ms: 45000,
                high_buffer_warning: 80,
            }
        }
    }

    type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

    fn lock(queue: &SampleQueue) -> MutexGuard<'_, VecDeque<f32>> {
        queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Local speaker output. The cpal stream lives on its own thread; this
    /// handle only touches the shared sample queue.
    pub struct CpalSink {
        queue: SampleQueue,
        max_samples: usize,
        config: CpalConfig,
        stop_tx: Sender<()>,
        is_stopped: Arc<AtomicBool>,
        /// Oldest playback run still allowed to write; only changed under the queue lock
        floor: AtomicU64,
        audio_thread: Option<thread::JoinHandle<()>>,
    }

    impl CpalSink {
        pub fn new(config: CpalConfig) -> Result<Self, AudioError> {
            let host = cpal::default_host();
            log::debug!("AudioSink: Using audio host: {:?}", host.id());

            let device = host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceError("No output device found".to_string()))?;
            log::debug!("AudioSink: Using output device: {:?}", device.name());

            let supported_config = device
                .default_output_config()
                .map_err(|e| AudioError::DeviceError(e.to_string()))?;
            let output_sample_rate = supported_config.sample_rate().0;
            let output_channels = supported_config.channels() as usize;
            let input_sample_rate = crate::SAMPLE_RATE;

            let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
            let callback_queue = Arc::clone(&queue);
            let (stop_tx, stop_rx) = channel::<()>();
            let (ready_tx, ready_rx) = channel::<Result<(), AudioError>>();

            let audio_thread = thread::spawn(move || {
                let step = input_sample_rate as f32 / output_sample_rate as f32;
                let mut position: f32 = 0.0;

                let stream = device.build_output_stream(
                    &supported_config.config(),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = lock(&callback_queue);
                        for frame in data.chunks_mut(output_channels) {
                            // Linear interpolation from 16 kHz to the device rate
                            let idx = position.floor() as usize;
                            let fract = position.fract();
                            let sample = match (queue.get(idx), queue.get(idx + 1)) {
                                (Some(a), Some(b)) => a * (1.0 - fract) + b * fract,
                                (Some(a), None) => *a,
                                _ => 0.0,
                            };
                            for channel in frame.iter_mut() {
                                *channel = sample;
                            }
                            position += step;
                        }
                        let consumed = (position.floor() as usize).min(queue.len());
                        queue.drain(..consumed);
                        position -= consumed as f32;
                        if queue.is_empty() {
                            position = 0.0;
                        }
                    },
                    move |err| {
                        log::error!("AudioSink: Stream error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until asked to stop
                let _ = stop_rx.recv();
                log::debug!("AudioSink: Audio thread exiting");
            });

            ready_rx
                .recv()
                .map_err(|e| AudioError::Stream(format!("audio thread died: {}", e)))??;

            log::info!(
                "🔊 Speaker ready ({} Hz, {} channels)",
                output_sample_rate,
                output_channels
            );

            Ok(Self {
                queue,
                max_samples: (config.buffer_size_ms as usize * input_sample_rate as usize) / 1000,
                config,
                stop_tx,
                is_stopped: Arc::new(AtomicBool::new(false)),
                floor: AtomicU64::new(0),
                audio_thread: Some(audio_thread),
            })
        }

        pub fn buffered_samples(&self) -> usize {
            lock(&self.queue).len()
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.is_stopped.store(true, Ordering::Release);
            let _ = self.stop_tx.send(());
            if let Some(thread) = self.audio_thread.take() {
                if let Err(e) = thread.join() {
                    log::error!("Failed to join audio thread: {:?}", e);
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl AudioSink for CpalSink {
        async fn write(&self, generation: u64, audio_data: &[u8]) -> Result<(), AudioError> {
            if self.is_stopped.load(Ordering::Acquire) {
                return Err(AudioError::WriteError("Sink is stopped".to_string()));
            }
            let samples = crate::audio::pcm16_to_i16(audio_data)?;

            let mut queue = lock(&self.queue);
            if generation < self.floor.load(Ordering::Acquire) {
                log::debug!("AudioSink: Dropping audio of stopped playback {}", generation);
                return Ok(());
            }
            if queue.len() + samples.len() > self.max_samples {
                return Err(AudioError::WriteError("Buffer full".to_string()));
            }
            queue.extend(crate::audio::i16_to_f32(&samples));

            let percentage = queue.len() * 100 / self.max_samples.max(1);
            if percentage > self.config.high_buffer_warning as usize {
                log::warn!("AudioSink: Buffer high warning: {}%", percentage);
            }
            Ok(())
        }

        fn clear(&self, generation: u64) {
            let mut queue = lock(&self.queue);
            self.floor.fetch_max(generation, Ordering::AcqRel);
            if !queue.is_empty() {
                log::debug!("AudioSink: Discarding {} queued samples", queue.len());
            }
            queue.clear();
        }

        async fn drain(&self) {
            while !lock(&self.queue).is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

}
