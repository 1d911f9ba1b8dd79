//! Silero VAD implementation
//!
//! Neural voice activity detection through `voice_activity_detector`. More
//! robust than the energy gate in noisy rooms at the cost of an onnx runtime.

use super::{SpeechDetector, FRAME_SAMPLES};
use crate::stt::SttError;
use voice_activity_detector::VoiceActivityDetector;

pub struct SileroDetector {
    vad: VoiceActivityDetector,
    threshold: f32,
}

impl SileroDetector {
    pub fn new(threshold: f32) -> Result<Self, SttError> {
        let vad = Self::build()?;
        log::info!(
            "🎤 Silero VAD initialized (chunk: {} samples, threshold: {:.2})",
            FRAME_SAMPLES,
            threshold
        );
        Ok(Self {
            vad,
            threshold: threshold.clamp(0.0, 1.0),
        })
    }

    fn build() -> Result<VoiceActivityDetector, SttError> {
        VoiceActivityDetector::builder()
            .sample_rate(crate::SAMPLE_RATE as i64)
            .chunk_size(FRAME_SAMPLES)
            .build()
            .map_err(|e| SttError::Initialization(format!("Failed to create Silero VAD: {}", e)))
    }
}

impl SpeechDetector for SileroDetector {
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool, SttError> {
        let probability = self.vad.predict(frame.iter().copied());
        Ok(probability >= self.threshold)
    }

    fn reset(&mut self) {
        // The detector keeps recurrent state and exposes no reset
        match Self::build() {
            Ok(vad) => self.vad = vad,
            Err(e) => log::error!("Failed to reset Silero VAD: {}", e),
        }
    }
}
