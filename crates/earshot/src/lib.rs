//! Earshot: the Performia live listener
//!
//! Takes guitar audio and pedal input, works out what is being played, and
//! publishes musical events on the shared-memory bus for the synth and UI
//! processes.
//!
//! - **ring**: wait-free sample ring between the audio callback and analysis
//! - **analyzer**: pitch (autocorrelation), chroma, onset (spectral flux), dynamics
//! - **chord**: template matching over 19 chord qualities, with smoothing
//! - **modes**: pedal-driven listening session and per-mode responses
//! - **pipeline**: glues the above to the bus
//!
//! Live capture (`pipewire` feature) and the MIDI pedal board (`midi`
//! feature) are optional; WAV replay goes through the same push path.

pub mod analyzer;
#[cfg(feature = "pipewire")]
pub mod capture;
pub mod chord;
pub mod control;
pub mod dsp;
pub mod frame;
#[cfg(feature = "midi")]
pub mod midi_input;
pub mod modes;
pub mod pipeline;
pub mod ring;

pub use analyzer::{AnalysisResult, Analyzer};
#[cfg(feature = "pipewire")]
pub use capture::{CaptureConfig, CaptureError, CaptureStats, CaptureStream};
pub use chord::{
    chord_tones, suggest_next_chord, ChordDetector, ChordError, ChordLabel, ChordQuality,
};
pub use control::{parse_midi_bytes, ControlInput, MidiMessage, PedalMap, TapEstimate, TapTempo};
pub use frame::AudioFrame;
#[cfg(feature = "midi")]
pub use midi_input::{list_midi_ports, MidiError, MidiPortInfo, PedalInput};
pub use modes::{
    ListenerEvent, ListenerSettings, ListenerStatus, Mode, ModeStateMachine, PhraseAnalysis,
    PhraseType, SystemCode,
};
pub use pipeline::{
    calibrate_wav, read_wav, CalibrationReport, InputPipeline, LatencyStats, PipelineError,
    PipelineStats, ReplaySummary,
};
pub use ring::{sample_ring, RingConsumer, RingError, RingProducer};
