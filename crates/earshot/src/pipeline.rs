//! Analysis thread: ring consumer → analyzer → chord detector → mode machine → bus.
//!
//! ```text
//! RingProducer ─▶ RingConsumer ─▶ Analyzer ─▶ ChordDetector ─▶ ModeStateMachine ─▶ EventBus
//!                                                                    ▲
//!                                  rtrb::Consumer<ControlInput> ─────┘
//! ```
//!
//! Timestamps come from a stream clock: the pipeline's creation time plus
//! the audio consumed so far. File replay therefore keeps musical timing
//! even when it runs faster than real time.

use crate::analyzer::{AnalysisResult, Analyzer};
use crate::chord::ChordDetector;
use crate::control::ControlInput;
use crate::frame::rms;
use crate::modes::{ListenerEvent, ListenerSettings, ModeStateMachine};
use crate::ring::{sample_ring, RingConsumer, RingError, RingProducer};
use perfbus::{BusError, EventBus, MusicalContext};
use perfconf::{ChordEmit, PerfConfig};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Frames kept for latency statistics.
const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to read {path}: {source}")]
    Wav {
        path: PathBuf,
        source: hound::Error,
    },

    #[error("{path} has {found} channels, pipeline expects {expected}")]
    ChannelMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("{path} is {found} Hz, pipeline runs at {expected} Hz")]
    SampleRateMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("calibration collected no audio")]
    CalibrationEmpty,
}

/// Processing latency over the last 100 blocks, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ms: f32,
    pub min_ms: f32,
    pub max_ms: f32,
    pub current_ms: f32,
    pub samples: usize,
}

/// Counters since the pipeline was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub blocks: u64,
    pub controls: u64,
    pub events_written: u64,
    pub bus_full: u64,
    pub ring_drops: u64,
}

/// Input level survey used to pick an onset threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// 10th percentile of block RMS.
    pub noise_floor: f32,
    pub peak: f32,
    pub average: f32,
    /// Twice the noise floor.
    pub recommended_threshold: f32,
    pub blocks: usize,
}

impl CalibrationReport {
    pub fn from_levels(levels: &[f32]) -> Option<Self> {
        if levels.is_empty() {
            return None;
        }
        let mut sorted = levels.to_vec();
        sorted.sort_by(f32::total_cmp);

        let noise_floor = sorted[(sorted.len() - 1) / 10];
        let peak = sorted[sorted.len() - 1];
        let average = sorted.iter().sum::<f32>() / sorted.len() as f32;
        Some(Self {
            noise_floor,
            peak,
            average,
            recommended_threshold: noise_floor * 2.0,
            blocks: sorted.len(),
        })
    }
}

/// Outcome of a file replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub frames: u64,
    pub blocks: u64,
    pub events: u64,
}

/// Interleaved f32 samples of a WAV file, with its channel count and rate.
pub struct WavAudio {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

/// Read a WAV file as interleaved f32, scaling integer formats to [-1, 1).
pub fn read_wav(path: &Path) -> Result<WavAudio, PipelineError> {
    let wav_err = |source| PipelineError::Wav {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(wav_err)?
        }
    };

    Ok(WavAudio {
        samples,
        channels: spec.channels as usize,
        sample_rate: spec.sample_rate,
    })
}

/// Survey block levels of a WAV file without running the analyzer.
pub fn calibrate_wav(path: &Path, block_size: usize) -> Result<CalibrationReport, PipelineError> {
    let audio = read_wav(path)?;
    let channels = audio.channels.max(1);
    let levels: Vec<f32> = audio
        .samples
        .chunks(block_size.max(1) * channels)
        .map(rms)
        .collect();
    CalibrationReport::from_levels(&levels).ok_or_else(|| {
        warn!("Calibration of {} found no audio", path.display());
        PipelineError::CalibrationEmpty
    })
}

pub struct InputPipeline {
    ring: RingConsumer,
    analyzer: Analyzer,
    chords: ChordDetector,
    chord_emit: ChordEmit,
    chord_pitch_confidence: f32,
    chord_accept_confidence: f32,
    machine: ModeStateMachine,
    bus: Option<Arc<EventBus>>,
    controls: Option<rtrb::Consumer<ControlInput>>,

    sample_rate: u32,
    block_size: usize,
    window_size: usize,
    block: Vec<f32>,
    mono: Vec<f32>,
    window: Vec<f32>,

    clock_origin_ns: u64,
    frames_consumed: u64,
    latencies: VecDeque<f32>,
    stats: PipelineStats,
    level: f32,
}

/// Nanoseconds spanned by `frames` at `sample_rate`, without overflowing on long sessions.
fn frames_to_ns(frames: u64, sample_rate: u32) -> u64 {
    let sr = u64::from(sample_rate.max(1));
    (frames / sr) * 1_000_000_000 + (frames % sr) * 1_000_000_000 / sr
}

impl InputPipeline {
    /// Build the pipeline and the ring that feeds it.
    ///
    /// The ring retains one analysis window of history so every block can be
    /// analyzed against the window ending at it.
    pub fn from_config(config: &PerfConfig) -> Result<(RingProducer, Self), PipelineError> {
        let (producer, consumer) = sample_ring(
            config.audio.ring_capacity,
            config.audio.channels,
            config.analysis.window_size,
        )?;
        let machine = ModeStateMachine::new(ListenerSettings::from_config(&config.listener));
        Ok((producer, Self::new(config, consumer, machine)))
    }

    pub fn new(config: &PerfConfig, ring: RingConsumer, machine: ModeStateMachine) -> Self {
        let analyzer = Analyzer::new(config.audio.sample_rate, &config.analysis);
        let window_size = analyzer.window_size();
        let block_size = config.audio.block_size.max(1);

        Self {
            analyzer,
            chords: ChordDetector::from_config(&config.chords),
            chord_emit: config.chords.emit,
            chord_pitch_confidence: config.analysis.chord_pitch_confidence,
            chord_accept_confidence: config.analysis.chord_accept_confidence,
            machine,
            bus: None,
            controls: None,
            sample_rate: config.audio.sample_rate.max(1),
            block_size,
            window_size,
            block: Vec::with_capacity(block_size * ring.channels()),
            mono: Vec::with_capacity(block_size),
            window: Vec::with_capacity(window_size),
            ring,
            clock_origin_ns: perfbus::now_ns(),
            frames_consumed: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            stats: PipelineStats::default(),
            level: 0.0,
        }
    }

    /// Write listener events to `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Take control inputs from a pedal thread.
    pub fn with_controls(mut self, controls: rtrb::Consumer<ControlInput>) -> Self {
        self.controls = Some(controls);
        self
    }

    pub fn machine(&self) -> &ModeStateMachine {
        &self.machine
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn channels(&self) -> usize {
        self.ring.channels()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current position of the stream clock.
    pub fn stream_time_ns(&self) -> u64 {
        self.clock_origin_ns + frames_to_ns(self.frames_consumed, self.sample_rate)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ring_drops: self.ring.drops(),
            ..self.stats
        }
    }

    pub fn latency(&self) -> LatencyStats {
        let Some(&current_ms) = self.latencies.back() else {
            return LatencyStats::default();
        };
        let n = self.latencies.len();
        LatencyStats {
            mean_ms: self.latencies.iter().sum::<f32>() / n as f32,
            min_ms: self.latencies.iter().copied().fold(f32::INFINITY, f32::min),
            max_ms: self.latencies.iter().copied().fold(0.0, f32::max),
            current_ms,
            samples: n,
        }
    }

    /// RMS of the most recent analysis window.
    pub fn input_level(&self) -> f32 {
        self.level
    }

    /// Apply a control input now, outside the queue.
    pub fn apply_control(&mut self, input: ControlInput) -> Vec<ListenerEvent> {
        self.stats.controls += 1;
        if input == ControlInput::ListenStart {
            self.analyzer.reset();
            self.chords.reset();
        }
        let events = self.machine.apply(input);
        let now = self.stream_time_ns();
        self.emit(&events, now);
        events
    }

    /// Drain queued controls, then every whole block in the ring.
    /// Returns everything the listener emitted along the way.
    pub fn process_available(&mut self) -> Vec<ListenerEvent> {
        let mut emitted = self.drain_controls();

        while self.ring.read_into(self.block_size, &mut self.block) {
            let started = Instant::now();
            self.frames_consumed += self.block_size as u64;

            let channels = self.ring.channels();
            self.mono.clear();
            self.mono.extend(
                self.block
                    .chunks_exact(channels)
                    .map(|f| f.iter().sum::<f32>() / channels as f32),
            );
            self.ring.trailing_mono_into(self.window_size, &mut self.window);
            self.level = rms(&self.window);

            let mut result = self.analyze_block();
            result.timestamp_ns = self.stream_time_ns();

            let events = self.machine.process(&result);
            self.emit(&events, result.timestamp_ns);
            if !events.is_empty() {
                self.publish_context(&result);
            }
            emitted.extend(events);

            self.stats.blocks += 1;
            self.record_latency(started.elapsed().as_secs_f32() * 1000.0);

            // Pedals pressed mid-batch take effect before the next block
            emitted.extend(self.drain_controls());
        }

        emitted
    }

    /// Pitch, onset and dynamics for the current block, plus a chord when
    /// the pitch is clear enough and the detector is confident.
    fn analyze_block(&mut self) -> AnalysisResult {
        let mut result = self.analyzer.analyze(&self.mono, &self.window);

        if result.pitch_confidence > self.chord_pitch_confidence {
            if let Some(chroma) = result.chroma {
                let detected = match self.chord_emit {
                    ChordEmit::Smoothed => self.chords.detect(&chroma),
                    ChordEmit::Raw => self.chords.detect_raw(&chroma),
                };
                match detected {
                    Ok((label, score)) if score > self.chord_accept_confidence => {
                        result = result.with_chord(label, score);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Chord detection skipped: {}", e),
                }
            }
        }
        result
    }

    fn drain_controls(&mut self) -> Vec<ListenerEvent> {
        let mut emitted = Vec::new();
        loop {
            let next = match self.controls.as_mut() {
                Some(queue) => queue.pop(),
                None => break,
            };
            match next {
                Ok(input) => emitted.extend(self.apply_control(input)),
                Err(_) => break,
            }
        }
        emitted
    }

    fn emit(&mut self, events: &[ListenerEvent], timestamp_ns: u64) {
        let Some(bus) = self.bus.as_ref() else {
            return;
        };
        let agent_id = self.machine.agent_id();
        for event in events {
            match bus.write(&event.to_bus_event(agent_id, timestamp_ns)) {
                Ok(()) => self.stats.events_written += 1,
                // The bus already logged the drop
                Err(_) => self.stats.bus_full += 1,
            }
        }
    }

    fn publish_context(&self, result: &AnalysisResult) {
        let Some(bus) = self.bus.as_ref() else {
            return;
        };
        let mut context: MusicalContext = bus.context();
        context.tempo = self.machine.tempo();
        context.dynamics = result.dynamics;
        if let Some(chord) = result.chord {
            context.key = chord.root as u32;
            context.mode = chord.quality.is_minor() as u32;
        }
        if let Some(chroma) = result.chroma {
            context.harmony[..12].copy_from_slice(&chroma);
            context.harmony[12] = result.chord.map_or(0.0, |c| c.root as f32);
        }
        bus.publish_context(&context);
    }

    fn record_latency(&mut self, ms: f32) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
    }

    /// Collect block levels from the ring for `duration` of audio.
    ///
    /// Gives up after twice the duration of wall time if the source stalls.
    pub fn calibrate(&mut self, duration: Duration) -> Result<CalibrationReport, PipelineError> {
        let wanted = (duration.as_secs_f64() * self.sample_rate as f64 / self.block_size as f64)
            .ceil()
            .max(1.0) as usize;
        let deadline = Instant::now() + duration * 2;
        let mut levels = Vec::with_capacity(wanted);

        info!("Calibrating for {:.1}s", duration.as_secs_f32());
        while levels.len() < wanted && Instant::now() < deadline {
            if self.ring.read_into(self.block_size, &mut self.block) {
                self.frames_consumed += self.block_size as u64;
                levels.push(rms(&self.block));
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let report = CalibrationReport::from_levels(&levels).ok_or_else(|| {
            warn!("Calibration collected no audio in {:?}", duration * 2);
            PipelineError::CalibrationEmpty
        })?;
        info!(
            "Calibration: noise floor {:.4}, peak {:.4}, threshold {:.4}",
            report.noise_floor, report.peak, report.recommended_threshold
        );
        Ok(report)
    }

    /// Push a WAV file through `producer` one block at a time, processing
    /// after every push.
    pub fn replay_wav(
        &mut self,
        producer: &mut RingProducer,
        path: &Path,
    ) -> Result<ReplaySummary, PipelineError> {
        let audio = read_wav(path)?;
        if audio.channels != self.channels() {
            return Err(PipelineError::ChannelMismatch {
                path: path.to_path_buf(),
                expected: self.channels(),
                found: audio.channels,
            });
        }
        if audio.sample_rate != self.sample_rate {
            return Err(PipelineError::SampleRateMismatch {
                path: path.to_path_buf(),
                expected: self.sample_rate,
                found: audio.sample_rate,
            });
        }

        info!(
            "Replaying {} ({} frames)",
            path.display(),
            audio.samples.len() / audio.channels.max(1)
        );
        let blocks_before = self.stats.blocks;
        let mut summary = ReplaySummary::default();
        for chunk in audio.samples.chunks_exact(self.block_size * audio.channels) {
            if !producer.write(chunk) {
                // Only the pipeline drains this ring; make room and retry once
                summary.events += self.process_available().len() as u64;
                if !producer.write(chunk) {
                    warn!("Ring still full after draining, dropping block");
                    continue;
                }
            }
            summary.frames += self.block_size as u64;
            summary.events += self.process_available().len() as u64;
        }
        summary.blocks = self.stats.blocks - blocks_before;
        Ok(summary)
    }
}
