//! Configuration sections - static values fixed at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Mode names understood by the listener, in their canonical order.
pub const KNOWN_MODES: [&str; 5] = [
    "off",
    "chord_follow",
    "call_response",
    "rhythmic_sync",
    "ambient_layer",
];

/// Largest event capacity that fits the 1 MiB bus layout.
pub const MAX_BUS_CAPACITY: u32 = 32760;

/// Audio device parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Default: 48000
    #[serde(default = "AudioConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Samples per hardware block.
    /// Default: 64
    #[serde(default = "AudioConfig::default_block_size")]
    pub block_size: usize,

    /// Default: 2
    #[serde(default = "AudioConfig::default_channels")]
    pub channels: usize,

    /// Sample ring capacity in frames (samples per channel).
    /// Default: 4096
    #[serde(default = "AudioConfig::default_ring_capacity")]
    pub ring_capacity: usize,
}

impl AudioConfig {
    fn default_sample_rate() -> u32 {
        48000
    }

    fn default_block_size() -> usize {
        64
    }

    fn default_channels() -> usize {
        2
    }

    fn default_ring_capacity() -> usize {
        4096
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            block_size: Self::default_block_size(),
            channels: Self::default_channels(),
            ring_capacity: Self::default_ring_capacity(),
        }
    }
}

/// Analyzer thresholds and window sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "AnalysisConfig::default_window_size")]
    pub window_size: usize,

    /// Zero-padded FFT length for autocorrelation.
    #[serde(default = "AnalysisConfig::default_fft_size")]
    pub fft_size: usize,

    #[serde(default = "AnalysisConfig::default_onset_threshold")]
    pub onset_threshold: f32,

    /// Minimum confidence before a pitch is reported.
    #[serde(default = "AnalysisConfig::default_pitch_confidence")]
    pub pitch_confidence: f32,

    /// Minimum pitch confidence before chroma is computed.
    #[serde(default = "AnalysisConfig::default_chroma_confidence")]
    pub chroma_confidence: f32,

    /// Minimum pitch confidence before the chord detector runs.
    #[serde(default = "AnalysisConfig::default_chord_pitch_confidence")]
    pub chord_pitch_confidence: f32,

    /// Minimum detector score for a chord to be accepted.
    #[serde(default = "AnalysisConfig::default_chord_accept_confidence")]
    pub chord_accept_confidence: f32,

    #[serde(default = "AnalysisConfig::default_min_hz")]
    pub min_hz: f32,

    #[serde(default = "AnalysisConfig::default_max_hz")]
    pub max_hz: f32,
}

impl AnalysisConfig {
    fn default_window_size() -> usize {
        1024
    }

    fn default_fft_size() -> usize {
        2048
    }

    fn default_onset_threshold() -> f32 {
        0.3
    }

    fn default_pitch_confidence() -> f32 {
        0.5
    }

    fn default_chroma_confidence() -> f32 {
        0.8
    }

    fn default_chord_pitch_confidence() -> f32 {
        0.7
    }

    fn default_chord_accept_confidence() -> f32 {
        0.6
    }

    fn default_min_hz() -> f32 {
        60.0
    }

    fn default_max_hz() -> f32 {
        1000.0
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_size: Self::default_window_size(),
            fft_size: Self::default_fft_size(),
            onset_threshold: Self::default_onset_threshold(),
            pitch_confidence: Self::default_pitch_confidence(),
            chroma_confidence: Self::default_chroma_confidence(),
            chord_pitch_confidence: Self::default_chord_pitch_confidence(),
            chord_accept_confidence: Self::default_chord_accept_confidence(),
            min_hz: Self::default_min_hz(),
            max_hz: Self::default_max_hz(),
        }
    }
}

/// Which chord label the pipeline forwards downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChordEmit {
    /// Recency-weighted label from the detection history.
    #[default]
    Smoothed,
    /// Best match of the current frame only.
    Raw,
}

impl ChordEmit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChordEmit::Smoothed => "smoothed",
            ChordEmit::Raw => "raw",
        }
    }
}

/// Chord detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordsConfig {
    /// Detections kept for temporal smoothing.
    /// Default: 4
    #[serde(default = "ChordsConfig::default_history")]
    pub history: usize,

    #[serde(default = "ChordsConfig::default_smoothing")]
    pub smoothing: bool,

    #[serde(default)]
    pub emit: ChordEmit,
}

impl ChordsConfig {
    fn default_history() -> usize {
        4
    }

    fn default_smoothing() -> bool {
        true
    }
}

impl Default for ChordsConfig {
    fn default() -> Self {
        Self {
            history: Self::default_history(),
            smoothing: Self::default_smoothing(),
            emit: ChordEmit::default(),
        }
    }
}

/// Listening session and mode state machine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Agent id stamped on every bus event.
    #[serde(default)]
    pub agent_id: u8,

    #[serde(default = "ListenerConfig::default_initial_mode")]
    pub initial_mode: String,

    /// RMS at or below this counts as silence.
    #[serde(default = "ListenerConfig::default_silence_floor")]
    pub silence_floor: f32,

    /// Silence that ends a call/response phrase.
    #[serde(default = "ListenerConfig::default_pause_ms")]
    pub pause_ms: u64,

    /// Probability of requesting a response to a detected call.
    #[serde(default = "ListenerConfig::default_responsiveness")]
    pub responsiveness: f32,

    #[serde(default = "ListenerConfig::default_tap_timeout_ms")]
    pub tap_timeout_ms: u64,

    /// Order of the mode pedal cycle.
    #[serde(default = "ListenerConfig::default_modes")]
    pub modes: Vec<String>,
}

impl ListenerConfig {
    fn default_initial_mode() -> String {
        "chord_follow".to_string()
    }

    fn default_silence_floor() -> f32 {
        0.01
    }

    fn default_pause_ms() -> u64 {
        500
    }

    fn default_responsiveness() -> f32 {
        0.5
    }

    fn default_tap_timeout_ms() -> u64 {
        2000
    }

    fn default_modes() -> Vec<String> {
        KNOWN_MODES[1..].iter().map(|m| m.to_string()).collect()
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            agent_id: 0,
            initial_mode: Self::default_initial_mode(),
            silence_floor: Self::default_silence_floor(),
            pause_ms: Self::default_pause_ms(),
            responsiveness: Self::default_responsiveness(),
            tap_timeout_ms: Self::default_tap_timeout_ms(),
            modes: Self::default_modes(),
        }
    }
}

/// Shared-memory event bus location and reader pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Segment name (file name under `shm_dir`).
    /// Default: PerformiaBuffer
    #[serde(default = "BusConfig::default_name")]
    pub name: String,

    /// Default: /dev/shm
    #[serde(default = "BusConfig::default_shm_dir")]
    pub shm_dir: PathBuf,

    /// Default: 32760
    #[serde(default = "BusConfig::default_capacity")]
    pub capacity: u32,

    /// Synthesis-side poll interval.
    #[serde(default = "BusConfig::default_poll_interval_us")]
    pub poll_interval_us: u64,

    /// Monitor/UI poll interval.
    #[serde(default = "BusConfig::default_monitor_poll_ms")]
    pub monitor_poll_ms: u64,
}

impl BusConfig {
    fn default_name() -> String {
        "PerformiaBuffer".to_string()
    }

    fn default_shm_dir() -> PathBuf {
        PathBuf::from("/dev/shm")
    }

    fn default_capacity() -> u32 {
        MAX_BUS_CAPACITY
    }

    fn default_poll_interval_us() -> u64 {
        500
    }

    fn default_monitor_poll_ms() -> u64 {
        100
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            shm_dir: Self::default_shm_dir(),
            capacity: Self::default_capacity(),
            poll_interval_us: Self::default_poll_interval_us(),
            monitor_poll_ms: Self::default_monitor_poll_ms(),
        }
    }
}

/// MIDI CC numbers for the pedal board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedalsConfig {
    #[serde(default = "PedalsConfig::default_sustain")]
    pub sustain: u8,
    #[serde(default = "PedalsConfig::default_mode")]
    pub mode: u8,
    #[serde(default = "PedalsConfig::default_sostenuto")]
    pub sostenuto: u8,
    #[serde(default = "PedalsConfig::default_soft")]
    pub soft: u8,
    #[serde(default = "PedalsConfig::default_expression")]
    pub expression: u8,
    #[serde(default = "PedalsConfig::default_tap")]
    pub tap: u8,

    /// Substring matched against MIDI input port names. Empty picks the first port.
    #[serde(default)]
    pub midi_port: String,
}

impl PedalsConfig {
    fn default_sustain() -> u8 {
        64
    }
    fn default_mode() -> u8 {
        65
    }
    fn default_sostenuto() -> u8 {
        66
    }
    fn default_soft() -> u8 {
        67
    }
    fn default_expression() -> u8 {
        11
    }
    fn default_tap() -> u8 {
        80
    }
}

impl Default for PedalsConfig {
    fn default() -> Self {
        Self {
            sustain: Self::default_sustain(),
            mode: Self::default_mode(),
            sostenuto: Self::default_sostenuto(),
            soft: Self::default_soft(),
            expression: Self::default_expression(),
            tap: Self::default_tap(),
            midi_port: String::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or EnvFilter directive string.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
