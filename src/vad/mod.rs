//! Voice Activity Detection (VAD) Module
//!
//! Decides frame by frame whether the canonical 16 kHz stream contains speech.
//! The recognizer uses it to open and close utterances.

use crate::stt::{SttError, SttSensitivity};

#[cfg(feature = "silero")]
pub mod silero;

/// Samples per detection frame (32 ms at 16 kHz)
pub const FRAME_SAMPLES: usize = 512;

/// RMS thresholds for sensitivity levels 0 (lenient) to 3 (strict)
const ENERGY_THRESHOLDS: [f32; 4] = [0.005, 0.01, 0.02, 0.04];

pub trait SpeechDetector: Send {
    /// Classify one frame of `FRAME_SAMPLES` canonical samples.
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool, SttError>;

    /// Forget any state carried between frames.
    fn reset(&mut self);
}

/// RMS energy gate with a short hangover so single quiet frames inside a
/// word do not end speech.
pub struct EnergyDetector {
    threshold: f32,
    hangover_frames: usize,
    hangover_left: usize,
}

impl EnergyDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            hangover_frames: 2,
            hangover_left: 0,
        }
    }

    pub fn from_sensitivity(level: u8) -> Self {
        let idx = (level as usize).min(ENERGY_THRESHOLDS.len() - 1);
        Self::new(ENERGY_THRESHOLDS[idx])
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn rms(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum: f64 = frame
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        (sum / frame.len() as f64).sqrt() as f32
    }
}

impl SpeechDetector for EnergyDetector {
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool, SttError> {
        if Self::rms(frame) >= self.threshold {
            self.hangover_left = self.hangover_frames;
            return Ok(true);
        }
        if self.hangover_left > 0 {
            self.hangover_left -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn reset(&mut self) {
        self.hangover_left = 0;
    }
}

/// Build the detector the sensitivity settings ask for.
pub fn create_detector(sensitivity: &SttSensitivity) -> Result<Box<dyn SpeechDetector>, SttError> {
    #[cfg(feature = "silero")]
    {
        let detector = silero::SileroDetector::new(1.0 - sensitivity.silero_sensitivity)?;
        return Ok(Box::new(detector));
    }

    #[cfg(not(feature = "silero"))]
    {
        let detector = EnergyDetector::from_sensitivity(sensitivity.webrtc_sensitivity);
        log::info!(
            "🎤 Energy VAD initialized (threshold: {:.3} RMS)",
            detector.threshold()
        );
        Ok(Box::new(detector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32) -> Vec<i16> {
        (0..FRAME_SAMPLES)
            .map(|i| {
                ((2.0 * std::f32::consts::PI * 200.0 * i as f32 / 16000.0).sin()
                    * amplitude
                    * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_silence_is_not_speech() {
        let mut vad = EnergyDetector::from_sensitivity(2);
        assert!(!vad.is_speech(&vec![0; FRAME_SAMPLES]).unwrap());
    }

    #[test]
    fn test_loud_frame_is_speech_with_hangover() {
        let mut vad = EnergyDetector::from_sensitivity(2);
        assert!(vad.is_speech(&tone(0.3)).unwrap());

        let silence = vec![0; FRAME_SAMPLES];
        assert!(vad.is_speech(&silence).unwrap());
        assert!(vad.is_speech(&silence).unwrap());
        assert!(!vad.is_speech(&silence).unwrap());
    }

    #[test]
    fn test_reset_clears_hangover() {
        let mut vad = EnergyDetector::from_sensitivity(2);
        vad.is_speech(&tone(0.3)).unwrap();
        vad.reset();
        assert!(!vad.is_speech(&vec![0; FRAME_SAMPLES]).unwrap());
    }

    #[test]
    fn test_sensitivity_levels_are_clamped() {
        assert_eq!(EnergyDetector::from_sensitivity(9).threshold(), 0.04);
        assert_eq!(EnergyDetector::from_sensitivity(0).threshold(), 0.005);
    }
}
