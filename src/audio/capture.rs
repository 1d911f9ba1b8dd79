use super::{AudioChannelAdapter, AudioError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample};
use dasp_sample::{FromSample, Sample};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Input device name, default device when `None`
    pub device_name: Option<String>,
}

/// Microphone capture on a dedicated thread.
///
/// The device delivers audio in its native rate and channel layout; every
/// callback buffer is handed to the [`AudioChannelAdapter`] as-is.
pub struct MicrophoneCapture {
    running: Arc<AtomicBool>,
    chunks: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl MicrophoneCapture {
    pub fn start(
        config: CaptureConfig,
        adapter: Arc<AudioChannelAdapter>,
    ) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = match config.device_name {
            Some(ref name) => host
                .input_devices()
                .map_err(|e| AudioError::DeviceError(format!("Failed to enumerate devices: {}", e)))?
                .find(|dev| dev.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceError(format!("Device '{}' not found", name)))?,
            None => host.default_input_device().ok_or_else(|| {
                AudioError::DeviceError("No default input device available".to_string())
            })?,
        };

        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let sample_format = supported.sample_format();

        let running = Arc::new(AtomicBool::new(true));
        let chunks = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = channel::<Result<(), AudioError>>();

        let thread_running = Arc::clone(&running);
        let thread_chunks = Arc::clone(&chunks);
        let thread = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream_config = supported.config();
                let stream = match sample_format {
                    SampleFormat::I16 => build_stream::<i16>(
                        &device,
                        &stream_config,
                        Arc::clone(&adapter),
                        Arc::clone(&thread_chunks),
                    ),
                    SampleFormat::F32 => build_stream::<f32>(
                        &device,
                        &stream_config,
                        Arc::clone(&adapter),
                        Arc::clone(&thread_chunks),
                    ),
                    format => Err(AudioError::UnsupportedFormat(format!("{:?}", format))),
                };

                let stream = match stream.and_then(|s| {
                    s.play().map_err(|e| AudioError::Stream(e.to_string()))?;
                    Ok(s)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while thread_running.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                log::info!("🎤 Capture thread stopped");
            })
            .map_err(|e| AudioError::DeviceError(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(RecvTimeoutError::Timeout) => {
                running.store(false, Ordering::Release);
                return Err(AudioError::DeviceError("Microphone did not start".to_string()));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AudioError::DeviceError("Capture thread exited".to_string()));
            }
        }

        log::info!(
            "🎤 Capturing from microphone ({} Hz, {} channels, {:?})",
            sample_rate,
            channels,
            sample_format
        );

        Ok(Self {
            running,
            chunks,
            thread: Some(thread),
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn chunks_captured(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    /// Stop the device and wait for the capture thread to acknowledge.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("🎤 Capture thread panicked");
            }
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    adapter: Arc<AudioChannelAdapter>,
    chunks: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Sample,
    i16: FromSample<T>,
{
    let rate = config.sample_rate.0;
    let channels = config.channels;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut bytes = Vec::with_capacity(data.len() * 2);
                for &sample in data {
                    bytes.extend_from_slice(&sample.to_sample::<i16>().to_le_bytes());
                }
                adapter.submit_chunk(&bytes, rate, channels);
                chunks.fetch_add(1, Ordering::Relaxed);
            },
            |err| log::error!("🎤 Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}
