use super::resampler::StreamResampler;
use super::{downmix_strided, f32_to_i16, i16_to_f32, pcm16_to_i16, AudioError};
use crate::SAMPLE_RATE;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Snapshot of adapter counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub chunks_submitted: u64,
    pub chunks_malformed: u64,
    pub chunks_overflowed: u64,
    pub silent_chunks: u64,
    pub samples_delivered: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    malformed: AtomicU64,
    overflowed: AtomicU64,
    silent: AtomicU64,
    delivered: AtomicU64,
}

struct ChunkQueue {
    chunks: Mutex<VecDeque<Vec<i16>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl ChunkQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<i16>>> {
        self.chunks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Normalizes microphone or network audio into canonical 16 kHz mono int16
/// chunks for the recognizer.
///
/// `submit_chunk` never fails and never blocks: malformed input is logged and
/// dropped, and when the recognizer falls behind the oldest queued chunk is
/// discarded to bound memory.
pub struct AudioChannelAdapter {
    queue: Arc<ChunkQueue>,
    resampler: Mutex<Option<StreamResampler>>,
    counters: Counters,
}

/// Consumer half handed to the recognition worker
pub struct AudioReceiver {
    queue: Arc<ChunkQueue>,
}

impl AudioChannelAdapter {
    pub fn new(capacity: usize) -> (Self, AudioReceiver) {
        let queue = Arc::new(ChunkQueue {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let adapter = Self {
            queue: Arc::clone(&queue),
            resampler: Mutex::new(None),
            counters: Counters::default(),
        };
        (adapter, AudioReceiver { queue })
    }

    /// Accept one chunk of signed 16-bit little-endian PCM in the source's
    /// native layout.
    pub fn submit_chunk(&self, bytes: &[u8], source_rate: u32, source_channels: u16) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        match self.normalize(bytes, source_rate, source_channels) {
            Ok(samples) if samples.is_empty() => {}
            Ok(samples) => self.enqueue(samples),
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("🎤 Dropping audio chunk ({} bytes): {}", bytes.len(), e);
            }
        }
    }

    fn normalize(
        &self,
        bytes: &[u8],
        source_rate: u32,
        source_channels: u16,
    ) -> Result<Vec<i16>, AudioError> {
        if source_rate == 0 || source_channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz with {} channels",
                source_rate, source_channels
            )));
        }

        let samples = pcm16_to_i16(bytes)?;
        let channels = source_channels as usize;
        if samples.len() % channels != 0 {
            return Err(AudioError::MalformedChunk(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        let frames = samples.len() / channels;

        let mut resampler = self
            .resampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if source_rate != SAMPLE_RATE
            && resampler.as_ref().map(|r| r.input_rate()) != Some(source_rate)
        {
            log::info!("🎤 Audio source at {} Hz, resampling to {} Hz", source_rate, SAMPLE_RATE);
            *resampler = Some(StreamResampler::new(source_rate, SAMPLE_RATE)?);
        }

        let nothing_pending = resampler.as_ref().map_or(true, |r| r.pending() == 0);
        if nothing_pending && samples.iter().all(|&s| s == 0) {
            // Silence needs no filtering, only the right length
            self.counters.silent.fetch_add(1, Ordering::Relaxed);
            let out_len = if source_rate == SAMPLE_RATE {
                frames
            } else {
                (frames as u64 * SAMPLE_RATE as u64).div_ceil(source_rate as u64) as usize
            };
            return Ok(vec![0i16; out_len]);
        }

        let mono = downmix_strided(&samples, channels);
        match resampler.as_mut() {
            Some(r) if source_rate != SAMPLE_RATE => {
                let resampled = r.process(&i16_to_f32(&mono))?;
                Ok(f32_to_i16(&resampled))
            }
            _ => Ok(mono),
        }
    }

    fn enqueue(&self, samples: Vec<i16>) {
        let delivered = samples.len() as u64;
        {
            let mut chunks = self.queue.lock();
            if chunks.len() >= self.queue.capacity {
                chunks.pop_front();
                let dropped = self.counters.overflowed.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 50 == 1 {
                    log::warn!("🎤 Recognizer lagging, dropped {} chunks so far", dropped);
                }
            }
            chunks.push_back(samples);
        }
        self.counters.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.queue.notify.notify_one();
    }

    /// Stop accepting audio; the receiver drains what is queued and then ends.
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    pub fn queued_chunks(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            chunks_submitted: self.counters.submitted.load(Ordering::Relaxed),
            chunks_malformed: self.counters.malformed.load(Ordering::Relaxed),
            chunks_overflowed: self.counters.overflowed.load(Ordering::Relaxed),
            silent_chunks: self.counters.silent.load(Ordering::Relaxed),
            samples_delivered: self.counters.delivered.load(Ordering::Relaxed),
        }
    }
}

impl AudioReceiver {
    /// Next canonical chunk, or `None` once the adapter is closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(chunk) = self.queue.lock().pop_front() {
                return Some(chunk);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Vec<i16>> {
        self.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::i16_to_pcm16;

    fn stereo_tone(rate: u32, seconds: f32) -> Vec<u8> {
        let frames = (rate as f32 * seconds) as usize;
        let mut interleaved = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let v = ((2.0 * std::f32::consts::PI * 300.0 * i as f32 / rate as f32).sin()
                * 8000.0) as i16;
            interleaved.push(v);
            interleaved.push(v / 2);
        }
        i16_to_pcm16(&interleaved)
    }

    fn drain(rx: &mut AudioReceiver) -> Vec<i16> {
        let mut all = Vec::new();
        while let Some(chunk) = rx.try_recv() {
            all.extend(chunk);
        }
        all
    }

    #[test]
    fn test_canonical_audio_passes_through() {
        let (adapter, mut rx) = AudioChannelAdapter::new(8);
        let samples = vec![1i16, -2, 3, -4];
        adapter.submit_chunk(&i16_to_pcm16(&samples), 16000, 1);
        assert_eq!(drain(&mut rx), samples);
    }

    #[test]
    fn test_stereo_48k_becomes_mono_16k() {
        let (adapter, mut rx) = AudioChannelAdapter::new(256);
        let bytes = stereo_tone(48000, 1.0);
        let input_len = bytes.len() / 2;
        for chunk in bytes.chunks(4800 * 2) {
            adapter.submit_chunk(chunk, 48000, 2);
        }

        let out = drain(&mut rx);
        let expected = input_len * 16000 / 48000 / 2;
        let tolerance = expected / 50;
        assert!(
            (out.len() as i64 - expected as i64).unsigned_abs() as usize <= tolerance,
            "got {} samples, expected about {}",
            out.len(),
            expected
        );
    }

    #[test]
    fn test_silence_short_circuits_with_adjusted_length() {
        let (adapter, mut rx) = AudioChannelAdapter::new(8);
        adapter.submit_chunk(&vec![0u8; 4410 * 2], 44100, 1);
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(adapter.stats().silent_chunks, 1);
    }

    #[test]
    fn test_malformed_chunks_are_dropped_quietly() {
        let (adapter, mut rx) = AudioChannelAdapter::new(8);
        adapter.submit_chunk(&[1, 2, 3], 16000, 1);
        adapter.submit_chunk(&i16_to_pcm16(&[1, 2, 3]), 16000, 2);
        adapter.submit_chunk(&i16_to_pcm16(&[1, 2]), 0, 1);

        assert!(rx.try_recv().is_none());
        assert_eq!(adapter.stats().chunks_malformed, 3);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let (adapter, mut rx) = AudioChannelAdapter::new(2);
        for value in 1..=3i16 {
            adapter.submit_chunk(&i16_to_pcm16(&[value]), 16000, 1);
        }
        assert_eq!(rx.try_recv(), Some(vec![2]));
        assert_eq!(rx.try_recv(), Some(vec![3]));
        assert_eq!(adapter.stats().chunks_overflowed, 1);
    }

    #[tokio::test]
    async fn test_receiver_ends_after_close() {
        let (adapter, mut rx) = AudioChannelAdapter::new(4);
        adapter.submit_chunk(&i16_to_pcm16(&[7]), 16000, 1);
        adapter.close();
        assert_eq!(rx.recv().await, Some(vec![7]));
        assert_eq!(rx.recv().await, None);
    }
}
