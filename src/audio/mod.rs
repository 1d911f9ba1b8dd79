//! Audio plumbing: canonical PCM conversions, the channel adapter that feeds
//! recognition, and the sinks synthesized speech is written to.
//!
//! Everything past the adapter speaks one format: 16 kHz, mono, signed 16-bit
//! little-endian PCM.

use dasp_sample::Sample;
use thiserror::Error;

pub mod adapter;
#[cfg(feature = "local-audio")]
pub mod capture;
pub mod resampler;
pub mod sink;

pub use adapter::{AudioChannelAdapter, AudioReceiver};
pub use sink::{AudioSink, OutputAudioSink};

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Malformed PCM chunk: {0}")]
    MalformedChunk(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resampler error: {0}")]
    Resampler(String),

    #[error("Failed to write audio data: {0}")]
    WriteError(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Decode signed 16-bit little-endian bytes. Odd lengths are malformed.
pub fn pcm16_to_i16(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::MalformedChunk(format!(
            "{} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn i16_to_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|s| s.to_sample::<f32>()).collect()
}

/// Convert back to int16, clipping anything outside [-1.0, 1.0].
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| s.clamp(-1.0, 1.0).to_sample::<i16>())
        .collect()
}

/// Keep the first channel of interleaved audio.
pub fn downmix_strided<T: Copy>(samples: &[T], channels: usize) -> Vec<T> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples.iter().step_by(channels).copied().collect()
}

/// Duration of a canonical mono buffer.
pub fn duration_of(samples: usize) -> std::time::Duration {
    std::time::Duration::from_secs_f64(samples as f64 / crate::SAMPLE_RATE as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_roundtrip_preserves_samples() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = i16_to_pcm16(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(pcm16_to_i16(&bytes).unwrap(), samples);
    }

    #[test]
    fn test_odd_byte_length_is_malformed() {
        assert!(matches!(
            pcm16_to_i16(&[0, 1, 2]),
            Err(AudioError::MalformedChunk(_))
        ));
    }

    #[test]
    fn test_f32_conversion_clips() {
        let out = f32_to_i16(&[2.0, -2.0, 0.0]);
        assert_eq!(out[0], i16::MAX);
        assert_eq!(out[1], i16::MIN);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn test_downmix_takes_every_nth_sample() {
        let stereo = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(downmix_strided(&stereo, 2), vec![1, 3, 5]);
        assert_eq!(downmix_strided(&stereo, 1), stereo);
    }
}
