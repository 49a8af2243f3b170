//! Interleaved multichannel sample blocks.

use serde::{Deserialize, Serialize};

/// A block of interleaved `f32` samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    channels: usize,
    samples: Vec<f32>,
}

impl AudioFrame {
    /// Wrap interleaved samples. A trailing partial frame is dropped.
    pub fn new(channels: usize, mut samples: Vec<f32>) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() / channels * channels;
        samples.truncate(whole);
        Self { channels, samples }
    }

    pub fn silent(channels: usize, frames: usize) -> Self {
        Self::new(channels, vec![0.0; channels.max(1) * frames])
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Channel average.
    pub fn mono(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames());
        self.mono_into(&mut out);
        out
    }

    pub fn mono_into(&self, out: &mut Vec<f32>) {
        out.clear();
        if self.channels == 1 {
            out.extend_from_slice(&self.samples);
            return;
        }
        let scale = 1.0 / self.channels as f32;
        out.extend(
            self.samples
                .chunks_exact(self.channels)
                .map(|frame| frame.iter().sum::<f32>() * scale),
        );
    }

    /// One channel de-interleaved, or `None` if out of range.
    pub fn channel(&self, index: usize) -> Option<Vec<f32>> {
        if index >= self.channels {
            return None;
        }
        Some(
            self.samples
                .iter()
                .skip(index)
                .step_by(self.channels)
                .copied()
                .collect(),
        )
    }

    /// RMS over every sample of every channel.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Root mean square, 0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
