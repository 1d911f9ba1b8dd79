use super::AudioError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Streaming polyphase (windowed-sinc) resampler for mono audio.
///
/// Input arrives in arbitrary chunk sizes; samples that do not fill a whole
/// resampler block are carried over to the next call so no audio is lost at
/// chunk boundaries.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    chunk_size: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, AudioError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "sample rates must be non-zero ({} -> {})",
                input_rate, output_rate
            )));
        }

        // 10 ms blocks keep the carried-over remainder small
        let chunk_size = (input_rate / 100).max(32) as usize;
        let ratio = output_rate as f64 / input_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 32,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
            .map_err(|e| AudioError::Resampler(format!("Failed to create resampler: {}", e)))?;

        log::debug!(
            "Resampler: {}Hz -> {}Hz (ratio {:.4}, block {} frames)",
            input_rate,
            output_rate,
            ratio,
            chunk_size
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            chunk_size,
            pending: Vec::new(),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Samples waiting for a full block.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed mono samples, return every output sample that is ready.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.pending.extend_from_slice(input);

        let mut output = Vec::with_capacity(
            (input.len() as f64 * self.output_rate as f64 / self.input_rate as f64) as usize + 1,
        );

        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let mut processed = self
                .resampler
                .process(&[block], None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            if let Some(channel) = processed.pop() {
                output.extend(channel);
            }
        }

        Ok(output)
    }

    /// Push out whatever is still buffered, padding the last block with silence.
    pub fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let blocks = vec![std::mem::take(&mut self.pending)];
        let mut processed = self
            .resampler
            .process_partial(Some(blocks.as_slice()), None)
            .map_err(|e| AudioError::Resampler(e.to_string()))?;
        Ok(processed.pop().unwrap_or_default())
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }

    /// Output length for `input_samples` once everything has been flushed.
    pub fn expected_output_len(&self, input_samples: usize) -> usize {
        (input_samples as f64 * self.output_rate as f64 / self.input_rate as f64).ceil() as usize
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
