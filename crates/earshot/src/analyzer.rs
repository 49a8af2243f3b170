//! Per-block pitch, chroma, onset and dynamics analysis.
//!
//! Pitch and chroma look at a sliding window (1024 samples by default) while
//! onset and dynamics look only at the incoming block. All spectral state
//! survives between calls, so one analyzer serves one input stream.
//!
//! Nothing here fails: silence, empty input and FFT errors all come back as
//! a result with no pitch, no chroma and no onset.

use crate::chord::ChordLabel;
use crate::dsp::{hann, Autocorrelator, ChromaBasis, MagnitudeSpectrum};
use crate::frame::rms;
use perfconf::AnalysisConfig;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::trace;

/// Spectrum length for chroma, independent of the autocorrelation padding.
pub const CHROMA_FFT_SIZE: usize = 1024;

/// Onset flux must exceed the previous frame's flux by this factor.
const ONSET_RISE: f32 = 1.5;

/// Everything known about one input block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub pitch_hz: Option<f32>,
    /// 0 whenever `pitch_hz` is `None`.
    pub pitch_confidence: f32,
    /// Unit-length pitch class profile, C first. Only present for confident pitches.
    pub chroma: Option<[f32; 12]>,
    pub chord: Option<ChordLabel>,
    pub chord_confidence: f32,
    /// MIDI notes of `chord`.
    pub chord_tones: Vec<u8>,
    pub onset: bool,
    /// RMS of the input block.
    pub dynamics: f32,
    pub latency_ms: f32,
    pub timestamp_ns: u64,
}

impl AnalysisResult {
    pub fn silent(timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            ..Default::default()
        }
    }

    /// Fractional MIDI note of the detected pitch.
    pub fn midi_pitch(&self) -> Option<f32> {
        self.pitch_hz
            .filter(|hz| *hz > 0.0)
            .map(|hz| 69.0 + 12.0 * (hz / 440.0).log2())
    }

    pub fn with_chord(mut self, label: ChordLabel, confidence: f32) -> Self {
        self.chord_tones = label.tones();
        self.chord = Some(label);
        self.chord_confidence = confidence;
        self
    }
}

pub struct Analyzer {
    sample_rate: u32,
    config: AnalysisConfig,
    pitch_window: Vec<f32>,
    // Raw samples of the current window, and the same samples Hann-weighted
    window: Vec<f32>,
    weighted: Vec<f32>,
    autocorr: Autocorrelator,
    chroma_spectrum: MagnitudeSpectrum,
    chroma_window: Vec<f32>,
    chroma_basis: ChromaBasis,
    planner: RealFftPlanner<f32>,
    onset: OnsetState,
    // Rolling mono history for callers without a ring buffer
    history: Vec<f32>,
}

struct OnsetState {
    spectrum: Option<MagnitudeSpectrum>,
    window: Vec<f32>,
    previous: Vec<f32>,
    previous_flux: f32,
}

impl Analyzer {
    pub fn new(sample_rate: u32, config: &AnalysisConfig) -> Self {
        let mut planner = RealFftPlanner::new();
        let window_size = config.window_size.max(1);
        let fft_size = config.fft_size.max(window_size);

        Self {
            sample_rate,
            pitch_window: hann(window_size),
            window: vec![0.0; window_size],
            weighted: vec![0.0; window_size],
            autocorr: Autocorrelator::new(&mut planner, fft_size),
            chroma_spectrum: MagnitudeSpectrum::new(&mut planner, CHROMA_FFT_SIZE),
            chroma_window: hann(window_size.min(CHROMA_FFT_SIZE)),
            chroma_basis: ChromaBasis::new(sample_rate, CHROMA_FFT_SIZE),
            planner,
            onset: OnsetState {
                spectrum: None,
                window: Vec::new(),
                previous: Vec::new(),
                previous_flux: 0.0,
            },
            history: vec![0.0; window_size],
            config: AnalysisConfig {
                window_size,
                fft_size,
                ..config.clone()
            },
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    /// Analyze a mono block against a caller-supplied mono window.
    ///
    /// The window is right-aligned to the configured size: shorter windows
    /// are zero-padded in front, longer ones keep their most recent samples.
    pub fn analyze(&mut self, frame: &[f32], window: &[f32]) -> AnalysisResult {
        let started = Instant::now();
        let mut result = AnalysisResult::silent(perfbus::now_ns());

        let size = self.config.window_size;
        let take = window.len().min(size);
        let pad = size - take;
        for (i, slot) in self.window.iter_mut().enumerate() {
            *slot = if i < pad {
                0.0
            } else {
                window[window.len() - take + (i - pad)]
            };
        }

        if let Some((hz, confidence)) = self.detect_pitch() {
            result.pitch_hz = Some(hz);
            result.pitch_confidence = confidence;
            if confidence > self.config.chroma_confidence {
                result.chroma = self.compute_chroma();
            }
        }

        result.onset = self.detect_onset(frame);
        result.dynamics = rms(frame);
        result.latency_ms = started.elapsed().as_secs_f32() * 1000.0;
        trace!(
            pitch = ?result.pitch_hz,
            confidence = result.pitch_confidence,
            onset = result.onset,
            "analyzed block"
        );
        result
    }

    /// Analyze a mono block using the analyzer's own rolling history as window.
    pub fn analyze_frame(&mut self, frame: &[f32]) -> AnalysisResult {
        let size = self.config.window_size;
        if frame.len() >= size {
            self.history.clear();
            self.history.extend_from_slice(&frame[frame.len() - size..]);
        } else {
            self.history.drain(..frame.len());
            self.history.extend_from_slice(frame);
        }
        let window = std::mem::take(&mut self.history);
        let result = self.analyze(frame, &window);
        self.history = window;
        result
    }

    /// Clear spectral state, e.g. at the start of a listening session.
    pub fn reset(&mut self) {
        self.onset.previous.fill(0.0);
        self.onset.previous_flux = 0.0;
        self.history.fill(0.0);
    }

    fn detect_pitch(&mut self) -> Option<(f32, f32)> {
        for ((dst, s), w) in self.weighted.iter_mut().zip(&self.window).zip(&self.pitch_window) {
            *dst = s * w;
        }
        let autocorr = match self.autocorr.process(&self.weighted) {
            Ok(a) => a,
            Err(e) => {
                trace!("autocorrelation failed: {}", e);
                return None;
            }
        };

        let sr = self.sample_rate as f32;
        let min_lag = ((sr / self.config.max_hz) as usize).max(1);
        let max_lag = ((sr / self.config.min_hz) as usize).min(autocorr.len());
        if min_lag >= max_lag {
            return None;
        }

        let mut lag = min_lag;
        let mut peak = autocorr[min_lag];
        for (i, &value) in autocorr.iter().enumerate().take(max_lag).skip(min_lag + 1) {
            if value > peak {
                peak = value;
                lag = i;
            }
        }

        let mean = autocorr.iter().map(|v| v.abs()).sum::<f32>() / autocorr.len() as f32;
        if !mean.is_finite() || mean <= f32::MIN_POSITIVE {
            return None;
        }

        let confidence = (peak / mean).clamp(0.0, 1.0);
        if confidence > self.config.pitch_confidence {
            Some((sr / lag as f32, confidence))
        } else {
            None
        }
    }

    fn compute_chroma(&mut self) -> Option<[f32; 12]> {
        // Most recent samples, under their own Hann
        let start = self.config.window_size - self.chroma_window.len();
        match self
            .chroma_spectrum
            .process(&self.window[start..], &self.chroma_window)
        {
            Ok(mags) => Some(self.chroma_basis.project(mags)),
            Err(e) => {
                trace!("chroma spectrum failed: {}", e);
                None
            }
        }
    }

    fn detect_onset(&mut self, frame: &[f32]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let state = &mut self.onset;

        let resized = state
            .spectrum
            .as_ref()
            .map_or(true, |s| s.size() != frame.len());
        if resized {
            state.spectrum = Some(MagnitudeSpectrum::new(&mut self.planner, frame.len()));
            state.window = hann(frame.len());
            state.previous = vec![0.0; frame.len() / 2 + 1];
        }

        let Some(spectrum) = state.spectrum.as_mut() else {
            return false;
        };
        let mags = match spectrum.process(frame, &state.window) {
            Ok(m) => m,
            Err(e) => {
                trace!("onset spectrum failed: {}", e);
                return false;
            }
        };

        let mut flux = 0.0;
        for (prev, &mag) in state.previous.iter_mut().zip(mags) {
            flux += (mag - *prev).max(0.0);
            *prev = mag;
        }

        let onset = flux > self.config.onset_threshold && flux > state.previous_flux * ONSET_RISE;
        state.previous_flux = flux;
        onset
    }
}
