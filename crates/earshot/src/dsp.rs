//! FFT building blocks shared by the analyzer.

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, FftError, RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

/// Reference frequency of pitch class A at octave 0.
const A0_HZ: f32 = 27.5;
/// Chroma basis octave weighting: centre octave and width.
const CENTER_OCTAVE: f32 = 5.0;
const OCTAVE_WIDTH: f32 = 2.0;

/// Symmetric Hann window (zero at both ends).
pub fn hann(len: usize) -> Vec<f32> {
    match len {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (len - 1) as f32;
            (0..len)
                .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / denom).cos())
                .collect()
        }
    }
}

/// Autocorrelation via `IFFT(|FFT(x)|^2)` with zero padding.
pub struct Autocorrelator {
    size: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    output: Vec<f32>,
}

impl Autocorrelator {
    pub fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        Self {
            size,
            input: forward.make_input_vec(),
            spectrum: forward.make_output_vec(),
            output: inverse.make_output_vec(),
            forward,
            inverse,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Circular autocorrelation of `signal` zero-padded to `size`.
    /// Longer input is truncated. The result is unnormalized.
    pub fn process(&mut self, signal: &[f32]) -> Result<&[f32], FftError> {
        let n = signal.len().min(self.size);
        self.input[..n].copy_from_slice(&signal[..n]);
        self.input[n..].fill(0.0);

        self.forward.process(&mut self.input, &mut self.spectrum)?;
        for bin in self.spectrum.iter_mut() {
            *bin = Complex::new(bin.norm_sqr(), 0.0);
        }
        self.inverse.process(&mut self.spectrum, &mut self.output)?;
        Ok(&self.output)
    }
}

/// Magnitude spectrum of a windowed block.
pub struct MagnitudeSpectrum {
    size: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
}

impl MagnitudeSpectrum {
    pub fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let forward = planner.plan_fft_forward(size);
        Self {
            size,
            input: forward.make_input_vec(),
            spectrum: forward.make_output_vec(),
            magnitudes: vec![0.0; size / 2 + 1],
            forward,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// `|rfft(signal * window)|`, zero-padded or truncated to `size`.
    pub fn process(&mut self, signal: &[f32], window: &[f32]) -> Result<&[f32], FftError> {
        let n = signal.len().min(window.len()).min(self.size);
        for (dst, (s, w)) in self.input.iter_mut().zip(signal.iter().zip(window)).take(n) {
            *dst = s * w;
        }
        self.input[n..].fill(0.0);

        self.forward.process(&mut self.input, &mut self.spectrum)?;
        for (mag, bin) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *mag = bin.norm();
        }
        Ok(&self.magnitudes)
    }
}

/// 12 x (n_fft/2 + 1) projection from magnitude bins to pitch classes (C = 0).
///
/// Each bin's weight is a Gaussian over its circular semitone distance to the
/// class, scaled by the bin's width in semitones, L2-normalized per bin, then
/// tapered toward a centre octave.
#[derive(Debug, Clone)]
pub struct ChromaBasis {
    bins: usize,
    weights: Vec<[f32; 12]>,
}

impl ChromaBasis {
    pub fn new(sample_rate: u32, n_fft: usize) -> Self {
        let bins = n_fft / 2 + 1;
        let sr = sample_rate as f32;

        // Fractional semitones above A0 for bins 1..n_fft (the full linear grid).
        let semis: Vec<f32> = (1..n_fft.max(2))
            .map(|k| 12.0 * (k as f32 * sr / n_fft as f32 / A0_HZ).log2())
            .collect();

        let mut weights = vec![[0.0f32; 12]; bins];
        for k in 1..bins {
            let Some(&position) = semis.get(k - 1) else {
                break;
            };
            let width = semis
                .get(k)
                .map(|next| (next - position).max(1.0))
                .unwrap_or(1.0);

            let column = &mut weights[k];
            for (class, w) in column.iter_mut().enumerate() {
                // Class 0 is C, three semitones above A
                let d = (position - (class as f32 + 3.0) + 6.0 + 120.0).rem_euclid(12.0) - 6.0;
                *w = (-0.5 * (2.0 * d / width).powi(2)).exp();
            }

            let norm = column.iter().map(|w| w * w).sum::<f32>().sqrt();
            let octave = (-0.5 * ((position / 12.0 - CENTER_OCTAVE) / OCTAVE_WIDTH).powi(2)).exp();
            if norm > 0.0 {
                for w in column.iter_mut() {
                    *w = *w / norm * octave;
                }
            }
        }

        Self { bins, weights }
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Project `magnitudes` and L2-normalize. All-zero input stays zero.
    pub fn project(&self, magnitudes: &[f32]) -> [f32; 12] {
        let mut chroma = [0.0f32; 12];
        for (column, &mag) in self.weights.iter().zip(magnitudes) {
            if mag == 0.0 {
                continue;
            }
            for (c, w) in chroma.iter_mut().zip(column) {
                *c += w * mag;
            }
        }
        normalize_l2(&mut chroma);
        chroma
    }
}

/// Scale to unit length in place; zero vectors are left alone.
pub fn normalize_l2(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
