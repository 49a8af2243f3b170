//! Listening session state and per-mode response strategies.
//!
//! Pedals drive the machine: sustain opens and closes a session, the mode
//! pedal cycles through the configured modes, expression sets the response
//! threshold and taps set the tempo. While a session is open every analysis
//! result is routed through the current mode; outside a session results are
//! dropped and only control-related events come out.

use crate::analyzer::AnalysisResult;
use crate::chord::ChordLabel;
use crate::control::{ControlInput, TapTempo};
use perfbus::{Event, EventFlags, EventType};
use perfconf::ListenerConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

const CHORD_HISTORY: usize = 16;
const DYNAMICS_HISTORY: usize = 100;
const ONSET_HISTORY: usize = 32;
const DEFAULT_TEMPO: f32 = 120.0;
const MIN_TEMPO: f32 = 40.0;
const MAX_TEMPO: f32 = 240.0;
/// More onsets than this switch rhythm tracking to the measured tempo.
const RHYTHM_ONSETS: usize = 4;
const AMBIENT_FADE_S: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Off,
    ChordFollow,
    CallResponse,
    RhythmicSync,
    AmbientLayer,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Off,
        Mode::ChordFollow,
        Mode::CallResponse,
        Mode::RhythmicSync,
        Mode::AmbientLayer,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::ChordFollow => "chord_follow",
            Mode::CallResponse => "call_response",
            Mode::RhythmicSync => "rhythmic_sync",
            Mode::AmbientLayer => "ambient_layer",
        }
    }

    /// Stable numeric id for the wire.
    pub fn index(self) -> u8 {
        match self {
            Mode::Off => 0,
            Mode::ChordFollow => 1,
            Mode::CallResponse => 2,
            Mode::RhythmicSync => 3,
            Mode::AmbientLayer => 4,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload code carried in `reserved` by SYSTEM and phrase events.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCode {
    ListeningStarted = 1,
    ListeningStopped = 2,
    ModeChanged = 3,
    ExpressionControl = 4,
    CallDetected = 5,
    AmbientLayer = 6,
    DensityControl = 7,
    FinalPhrase = 8,
}

impl SystemCode {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            1 => SystemCode::ListeningStarted,
            2 => SystemCode::ListeningStopped,
            3 => SystemCode::ModeChanged,
            4 => SystemCode::ExpressionControl,
            5 => SystemCode::CallDetected,
            6 => SystemCode::AmbientLayer,
            7 => SystemCode::DensityControl,
            8 => SystemCode::FinalPhrase,
            _ => return None,
        })
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhraseType {
    SingleNote,
    ShortMotif,
    FastRun,
    MelodicPhrase,
}

/// Summary of a run of sounding frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhraseAnalysis {
    pub length_s: f32,
    /// Frames flagged as onsets.
    pub note_count: usize,
    pub dynamics_mean: f32,
    pub dynamics_max: f32,
    pub dynamics_std: f32,
    pub pitches: Vec<f32>,
    pub chords: Vec<ChordLabel>,
    pub phrase_type: PhraseType,
}

#[derive(Debug, Clone, PartialEq)]
struct PhraseFrame {
    timestamp_ns: u64,
    pitch_hz: Option<f32>,
    dynamics: f32,
    onset: bool,
    chord: Option<ChordLabel>,
}

fn analyze_phrase(frames: &[PhraseFrame]) -> Option<PhraseAnalysis> {
    let (first, last) = (frames.first()?, frames.last()?);
    let n = frames.len() as f32;

    let length_s = last.timestamp_ns.saturating_sub(first.timestamp_ns) as f32 / 1e9;
    let note_count = frames.iter().filter(|f| f.onset).count();
    let dynamics_mean = frames.iter().map(|f| f.dynamics).sum::<f32>() / n;
    let dynamics_max = frames.iter().map(|f| f.dynamics).fold(0.0, f32::max);
    let variance = frames
        .iter()
        .map(|f| (f.dynamics - dynamics_mean).powi(2))
        .sum::<f32>()
        / n;

    let phrase_type = if note_count == 1 {
        PhraseType::SingleNote
    } else if note_count < 4 {
        PhraseType::ShortMotif
    } else if length_s < 2.0 {
        PhraseType::FastRun
    } else {
        PhraseType::MelodicPhrase
    };

    Some(PhraseAnalysis {
        length_s,
        note_count,
        dynamics_mean,
        dynamics_max,
        dynamics_std: variance.sqrt(),
        pitches: frames.iter().filter_map(|f| f.pitch_hz).collect(),
        chords: frames.iter().filter_map(|f| f.chord).collect(),
        phrase_type,
    })
}

/// Everything the listener tells the rest of the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListenerEvent {
    ListeningStarted {
        mode: Mode,
    },
    ListeningStopped,
    ModeChanged {
        from: Mode,
        to: Mode,
    },
    ExpressionControl {
        value: f32,
        threshold: f32,
    },
    TempoTap {
        bpm: f32,
        confidence: f32,
    },
    Chord {
        chord: ChordLabel,
        previous: Option<ChordLabel>,
        tones: Vec<u8>,
        confidence: f32,
    },
    CallDetected {
        phrase: PhraseAnalysis,
        respond: bool,
    },
    RhythmSync {
        tempo: f32,
        dynamics: f32,
    },
    TempoUpdate {
        bpm: f32,
        confidence: f32,
    },
    AmbientLayer {
        intensity: f32,
        center_pitch: Option<f32>,
        harmony: Option<ChordLabel>,
    },
    DensityControl {
        target_density: f32,
        fade_time_s: f32,
    },
    FinalPhrase {
        phrase: PhraseAnalysis,
    },
}

impl ListenerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ListenerEvent::ListeningStarted { .. } => "listening_started",
            ListenerEvent::ListeningStopped => "listening_stopped",
            ListenerEvent::ModeChanged { .. } => "mode_changed",
            ListenerEvent::ExpressionControl { .. } => "expression_control",
            ListenerEvent::TempoTap { .. } => "tempo_tap",
            ListenerEvent::Chord { .. } => "chord",
            ListenerEvent::CallDetected { .. } => "call_detected",
            ListenerEvent::RhythmSync { .. } => "rhythm_sync",
            ListenerEvent::TempoUpdate { .. } => "tempo_update",
            ListenerEvent::AmbientLayer { .. } => "ambient_layer",
            ListenerEvent::DensityControl { .. } => "density_control",
            ListenerEvent::FinalPhrase { .. } => "final_phrase",
        }
    }

    /// The 32-byte bus record for this event.
    ///
    /// SYSTEM events carry a [`SystemCode`] in `reserved`. Chords carry the
    /// root as a MIDI note in `pitch`, confidence in `velocity` and the
    /// packed label in `reserved`. Tempo events carry BPM in `pitch`.
    pub fn to_bus_event(&self, agent_id: u8, timestamp_ns: u64) -> Event {
        let system = |code: SystemCode| {
            Event::at(timestamp_ns, agent_id, EventType::System).with_reserved(code.code())
        };
        let synth = EventFlags::FROM_INPUT | EventFlags::NEEDS_SYNTH;

        let event = match self {
            ListenerEvent::ListeningStarted { mode } => {
                system(SystemCode::ListeningStarted).with_pitch(mode.index() as f32)
            }
            ListenerEvent::ListeningStopped => system(SystemCode::ListeningStopped),
            ListenerEvent::ModeChanged { from, to } => system(SystemCode::ModeChanged)
                .with_pitch(to.index() as f32)
                .with_velocity(from.index() as f32),
            ListenerEvent::ExpressionControl { value, threshold } => {
                system(SystemCode::ExpressionControl)
                    .with_pitch(*threshold)
                    .with_velocity(*value)
            }
            ListenerEvent::TempoTap { bpm, confidence }
            | ListenerEvent::TempoUpdate { bpm, confidence } => {
                Event::at(timestamp_ns, agent_id, EventType::TempoChange)
                    .with_pitch(*bpm)
                    .with_velocity(*confidence)
            }
            ListenerEvent::Chord {
                chord, confidence, ..
            } => Event::at(timestamp_ns, agent_id, EventType::Chord)
                .with_pitch(60.0 + chord.root as f32)
                .with_velocity(*confidence)
                .with_reserved(chord.pack())
                .with_flags(synth),
            ListenerEvent::CallDetected { phrase, respond } => {
                let event = system(SystemCode::CallDetected)
                    .with_pitch(phrase.note_count as f32)
                    .with_velocity(phrase.dynamics_mean)
                    .with_duration_ms(seconds_to_ms(phrase.length_s));
                if *respond {
                    event.with_flags(synth)
                } else {
                    event
                }
            }
            ListenerEvent::RhythmSync { tempo, dynamics } => {
                Event::at(timestamp_ns, agent_id, EventType::Onset)
                    .with_pitch(*tempo)
                    .with_velocity(*dynamics)
            }
            ListenerEvent::AmbientLayer {
                intensity,
                center_pitch,
                ..
            } => system(SystemCode::AmbientLayer)
                .with_pitch(center_pitch.unwrap_or(0.0))
                .with_velocity(*intensity)
                .with_flags(synth),
            ListenerEvent::DensityControl {
                target_density,
                fade_time_s,
            } => system(SystemCode::DensityControl)
                .with_velocity(*target_density)
                .with_duration_ms(seconds_to_ms(*fade_time_s))
                .with_flags(synth),
            ListenerEvent::FinalPhrase { phrase } => {
                Event::at(timestamp_ns, agent_id, EventType::PatternChange)
                    .with_pitch(phrase.note_count as f32)
                    .with_velocity(phrase.dynamics_mean)
                    .with_duration_ms(seconds_to_ms(phrase.length_s))
                    .with_reserved(SystemCode::FinalPhrase.code())
                    .with_flags(EventFlags::PATTERN_END)
            }
        };

        let mut flags = event.flags;
        flags.insert(EventFlags::FROM_INPUT);
        event.with_flags(flags)
    }
}

fn seconds_to_ms(seconds: f32) -> u16 {
    (seconds * 1000.0).round().clamp(0.0, u16::MAX as f32) as u16
}

/// Static listener parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSettings {
    pub agent_id: u8,
    pub initial_mode: Mode,
    /// Mode pedal cycle order.
    pub modes: Vec<Mode>,
    pub silence_floor: f32,
    pub pause_ns: u64,
    pub responsiveness: f32,
    pub tap_timeout_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self::from_config(&ListenerConfig::default())
    }
}

impl ListenerSettings {
    /// Unknown mode names are skipped with a warning.
    pub fn from_config(config: &ListenerConfig) -> Self {
        let mut modes: Vec<Mode> = config
            .modes
            .iter()
            .filter_map(|name| {
                let mode = Mode::from_name(name);
                if mode.is_none() {
                    warn!("Ignoring unknown listener mode '{}'", name);
                }
                mode
            })
            .collect();
        if modes.is_empty() {
            modes = Mode::ALL[1..].to_vec();
        }

        let initial_mode = Mode::from_name(&config.initial_mode).unwrap_or_else(|| {
            warn!(
                "Unknown initial mode '{}', using {}",
                config.initial_mode, modes[0]
            );
            modes[0]
        });

        Self {
            agent_id: config.agent_id,
            initial_mode,
            modes,
            silence_floor: config.silence_floor,
            pause_ns: config.pause_ms.saturating_mul(1_000_000),
            responsiveness: config.responsiveness.clamp(0.0, 1.0),
            tap_timeout_ms: config.tap_timeout_ms,
        }
    }
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub listening: bool,
    pub mode: Mode,
    pub current_chord: Option<ChordLabel>,
    pub tempo: f32,
    pub phrase_frames: usize,
    pub response_threshold: f32,
}

#[derive(Debug, Clone)]
struct Session {
    current_chord: Option<ChordLabel>,
    previous_chord: Option<ChordLabel>,
    chord_history: VecDeque<ChordLabel>,
    tempo: f32,
    dynamics_history: VecDeque<f32>,
    onset_times: VecDeque<u64>,
    phrase: Vec<PhraseFrame>,
    last_sound_ns: Option<u64>,
}

impl Session {
    fn new(tempo: f32) -> Self {
        Self {
            current_chord: None,
            previous_chord: None,
            chord_history: VecDeque::with_capacity(CHORD_HISTORY),
            tempo,
            dynamics_history: VecDeque::with_capacity(DYNAMICS_HISTORY),
            onset_times: VecDeque::with_capacity(ONSET_HISTORY),
            phrase: Vec::new(),
            last_sound_ns: None,
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, limit: usize) {
    if queue.len() == limit {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// Listening session plus mode dispatch. Single owner, single thread.
pub struct ModeStateMachine {
    settings: ListenerSettings,
    mode: Mode,
    listening: bool,
    response_threshold: f32,
    taps: TapTempo,
    session: Session,
    rng: StdRng,
}

impl ModeStateMachine {
    pub fn new(settings: ListenerSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    /// Use a specific random source for response decisions.
    pub fn with_rng(settings: ListenerSettings, rng: StdRng) -> Self {
        Self {
            mode: settings.initial_mode,
            listening: false,
            response_threshold: 0.05,
            taps: TapTempo::new(settings.tap_timeout_ms),
            session: Session::new(DEFAULT_TEMPO),
            settings,
            rng,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn tempo(&self) -> f32 {
        self.session.tempo
    }

    pub fn agent_id(&self) -> u8 {
        self.settings.agent_id
    }

    pub fn status(&self) -> ListenerStatus {
        ListenerStatus {
            listening: self.listening,
            mode: self.mode,
            current_chord: self.session.current_chord,
            tempo: self.session.tempo,
            phrase_frames: self.session.phrase.len(),
            response_threshold: self.response_threshold,
        }
    }

    /// Apply one control input.
    pub fn apply(&mut self, input: ControlInput) -> Vec<ListenerEvent> {
        match input {
            ControlInput::ListenStart => self.on_listening_start(),
            ControlInput::ListenStop => self.on_listening_stop(),
            ControlInput::ModeCycle => self.on_mode_cycle(),
            ControlInput::Expression { value } => self.on_expression(value),
            ControlInput::Tap { timestamp_ns } => self.on_tap(timestamp_ns),
            ControlInput::Tempo { bpm } => self.on_tempo(bpm),
        }
    }

    /// Open a session. Ignored while one is already open.
    pub fn on_listening_start(&mut self) -> Vec<ListenerEvent> {
        if self.listening {
            return Vec::new();
        }
        self.listening = true;
        // Tempo survives between sessions; everything else starts over
        self.session = Session::new(self.session.tempo);
        info!("Started listening in {} mode", self.mode);
        vec![ListenerEvent::ListeningStarted { mode: self.mode }]
    }

    /// Close the session, flushing any phrase in progress first.
    pub fn on_listening_stop(&mut self) -> Vec<ListenerEvent> {
        if !self.listening {
            return Vec::new();
        }
        self.listening = false;

        let mut events = Vec::with_capacity(2);
        let frames = std::mem::take(&mut self.session.phrase);
        if let Some(phrase) = analyze_phrase(&frames) {
            debug!(
                "Final phrase: {} notes over {:.2}s",
                phrase.note_count, phrase.length_s
            );
            events.push(ListenerEvent::FinalPhrase { phrase });
        }
        events.push(ListenerEvent::ListeningStopped);
        info!("Stopped listening");
        events
    }

    /// Advance to the next mode in the cycle.
    pub fn on_mode_cycle(&mut self) -> Vec<ListenerEvent> {
        let modes = &self.settings.modes;
        if modes.is_empty() {
            warn!("No modes to cycle through, staying in {}", self.mode);
            return Vec::new();
        }
        let next = match modes.iter().position(|m| *m == self.mode) {
            Some(i) => modes[(i + 1) % modes.len()],
            None => modes[0],
        };
        self.set_mode(next)
    }

    pub fn set_mode(&mut self, mode: Mode) -> Vec<ListenerEvent> {
        let from = std::mem::replace(&mut self.mode, mode);
        info!("Changed mode: {} -> {}", from, mode);
        vec![ListenerEvent::ModeChanged { from, to: mode }]
    }

    /// Expression pedal: lower values give a more sensitive response threshold.
    pub fn on_expression(&mut self, value: f32) -> Vec<ListenerEvent> {
        let value = value.clamp(0.0, 1.0);
        self.response_threshold = 0.05 + 0.2 * (1.0 - value);
        vec![ListenerEvent::ExpressionControl {
            value,
            threshold: self.response_threshold,
        }]
    }

    pub fn on_tap(&mut self, timestamp_ns: u64) -> Vec<ListenerEvent> {
        match self.taps.tap(timestamp_ns) {
            Some(estimate) => {
                self.session.tempo = estimate.bpm;
                info!("Tap tempo: {:.1} BPM ({} taps)", estimate.bpm, estimate.taps);
                vec![ListenerEvent::TempoTap {
                    bpm: estimate.bpm,
                    confidence: estimate.confidence,
                }]
            }
            None => Vec::new(),
        }
    }

    pub fn on_tempo(&mut self, bpm: f32) -> Vec<ListenerEvent> {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Vec::new();
        }
        self.session.tempo = bpm;
        vec![ListenerEvent::TempoTap {
            bpm,
            confidence: 1.0,
        }]
    }

    /// Route one analysis result through the current mode.
    pub fn process(&mut self, result: &AnalysisResult) -> Vec<ListenerEvent> {
        if !self.listening {
            return Vec::new();
        }
        let mut events = Vec::new();
        let now = result.timestamp_ns;

        push_bounded(&mut self.session.dynamics_history, result.dynamics, DYNAMICS_HISTORY);
        if result.onset {
            push_bounded(&mut self.session.onset_times, now, ONSET_HISTORY);
        }

        if let Some(finished) = self.accumulate_phrase(result) {
            if self.mode == Mode::CallResponse {
                let respond = self.rng.gen::<f32>() < self.settings.responsiveness;
                debug!(
                    "Call detected: {:?}, {} notes, respond={}",
                    finished.phrase_type, finished.note_count, respond
                );
                events.push(ListenerEvent::CallDetected {
                    phrase: finished,
                    respond,
                });
            }
        }

        let chord_change = self.track_chord(result);

        match self.mode {
            Mode::Off | Mode::CallResponse => {}
            Mode::ChordFollow => {
                if let Some(chord) = chord_change {
                    events.push(ListenerEvent::Chord {
                        chord,
                        previous: self.session.previous_chord,
                        tones: result.chord_tones.clone(),
                        confidence: result.chord_confidence,
                    });
                }
            }
            Mode::RhythmicSync => {
                if result.onset {
                    events.extend(self.rhythm_sync(result.dynamics));
                }
            }
            Mode::AmbientLayer => {
                let history = &self.session.dynamics_history;
                let target = history.iter().sum::<f32>() / history.len().max(1) as f32;
                events.push(ListenerEvent::AmbientLayer {
                    intensity: result.dynamics,
                    center_pitch: result.pitch_hz,
                    harmony: result.chord,
                });
                events.push(ListenerEvent::DensityControl {
                    target_density: target,
                    fade_time_s: AMBIENT_FADE_S,
                });
            }
        }

        events
    }

    /// Append a sounding frame. Returns the finished phrase when an onset
    /// follows a long enough pause.
    fn accumulate_phrase(&mut self, result: &AnalysisResult) -> Option<PhraseAnalysis> {
        if result.dynamics <= self.settings.silence_floor {
            return None;
        }
        let now = result.timestamp_ns;
        let session = &mut self.session;

        let paused = session
            .last_sound_ns
            .is_some_and(|last| now.saturating_sub(last) >= self.settings.pause_ns);
        let finished = if paused && result.onset && !session.phrase.is_empty() {
            let frames = std::mem::take(&mut session.phrase);
            analyze_phrase(&frames)
        } else {
            None
        };

        session.phrase.push(PhraseFrame {
            timestamp_ns: now,
            pitch_hz: result.pitch_hz,
            dynamics: result.dynamics,
            onset: result.onset,
            chord: result.chord,
        });
        session.last_sound_ns = Some(now);
        finished
    }

    /// Record a new chord. Returns it only when it differs from the current one.
    fn track_chord(&mut self, result: &AnalysisResult) -> Option<ChordLabel> {
        let chord = result.chord?;
        let session = &mut self.session;
        if session.current_chord == Some(chord) {
            return None;
        }
        session.previous_chord = session.current_chord.replace(chord);
        push_bounded(&mut session.chord_history, chord, CHORD_HISTORY);
        debug!(
            "Chord change: {} ({:.2})",
            chord, result.chord_confidence
        );
        Some(chord)
    }

    fn rhythm_sync(&mut self, dynamics: f32) -> [ListenerEvent; 2] {
        let onsets = &self.session.onset_times;
        let confidence = if onsets.len() > RHYTHM_ONSETS {
            if let Some(bpm) = median_tempo(onsets) {
                self.session.tempo = bpm;
            }
            0.7
        } else {
            0.3
        };
        let tempo = self.session.tempo;
        debug!("Rhythm sync: {:.1} BPM", tempo);
        [
            ListenerEvent::RhythmSync { tempo, dynamics },
            ListenerEvent::TempoUpdate {
                bpm: tempo,
                confidence,
            },
        ]
    }

    /// Chords seen this session, oldest first.
    pub fn chord_history(&self) -> impl Iterator<Item = &ChordLabel> {
        self.session.chord_history.iter()
    }
}

/// BPM from the median inter-onset interval, clamped to a playable range.
fn median_tempo(onsets: &VecDeque<u64>) -> Option<f32> {
    let mut intervals: Vec<u64> = onsets
        .iter()
        .zip(onsets.iter().skip(1))
        .map(|(a, b)| b.saturating_sub(*a))
        .filter(|d| *d > 0)
        .collect();
    if intervals.is_empty() {
        return None;
    }
    intervals.sort_unstable();
    let mid = intervals.len() / 2;
    let median_ns = if intervals.len() % 2 == 0 {
        (intervals[mid - 1] + intervals[mid]) as f64 / 2.0
    } else {
        intervals[mid] as f64
    };
    Some(((60e9 / median_ns) as f32).clamp(MIN_TEMPO, MAX_TEMPO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::ChordQuality;
    use pretty_assertions::assert_eq;

    const MS: u64 = 1_000_000;

    fn machine(mode: Mode) -> ModeStateMachine {
        let settings = ListenerSettings {
            initial_mode: mode,
            ..Default::default()
        };
        ModeStateMachine::with_rng(settings, StdRng::seed_from_u64(7))
    }

    fn frame(at_ms: u64, dynamics: f32, onset: bool) -> AnalysisResult {
        AnalysisResult {
            dynamics,
            onset,
            timestamp_ns: at_ms * MS,
            ..Default::default()
        }
    }

    fn chord_frame(at_ms: u64, root: u8) -> AnalysisResult {
        frame(at_ms, 0.2, false).with_chord(ChordLabel::new(root, ChordQuality::Major), 0.9)
    }

    fn kinds(events: &[ListenerEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in Mode::ALL {
            assert_eq!(Mode::from_name(mode.as_str()), Some(mode));
        }
        assert_eq!(Mode::from_name("chord"), None);
    }

    #[test]
    fn test_results_dropped_when_not_listening() {
        let mut m = machine(Mode::ChordFollow);
        assert!(m.process(&chord_frame(0, 0)).is_empty());
        assert_eq!(m.status().current_chord, None);
    }

    #[test]
    fn test_chord_follow_emits_on_change_only() {
        let mut m = machine(Mode::ChordFollow);
        m.on_listening_start();

        let mut events = Vec::new();
        for (i, root) in [0, 0, 7, 7].into_iter().enumerate() {
            events.extend(m.process(&chord_frame(i as u64 * 10, root)));
        }

        assert_eq!(kinds(&events), vec!["chord", "chord"]);
        match &events[1] {
            ListenerEvent::Chord {
                chord,
                previous,
                tones,
                confidence,
            } => {
                assert_eq!(chord.to_string(), "G");
                assert_eq!(previous.map(|c| c.to_string()), Some("C".to_string()));
                assert_eq!(tones, &vec![67, 71, 74]);
                assert_eq!(*confidence, 0.9);
            }
            other => panic!("expected chord, got {other:?}"),
        }
        assert_eq!(m.chord_history().count(), 2);
    }

    #[test]
    fn test_listening_lifecycle_order() {
        let mut m = machine(Mode::ChordFollow);
        let mut events = m.on_listening_start();
        events.extend(m.process(&frame(0, 0.3, true)));
        events.extend(m.process(&frame(10, 0.2, false)));
        events.extend(m.process(&frame(20, 0.1, false)));
        events.extend(m.on_listening_stop());

        assert_eq!(
            kinds(&events),
            vec!["listening_started", "final_phrase", "listening_stopped"]
        );
        match &events[1] {
            ListenerEvent::FinalPhrase { phrase } => {
                assert_eq!(phrase.note_count, 1);
                assert_eq!(phrase.phrase_type, PhraseType::SingleNote);
                assert!((phrase.length_s - 0.02).abs() < 1e-6);
                assert!((phrase.dynamics_max - 0.3).abs() < 1e-6);
            }
            other => panic!("expected final phrase, got {other:?}"),
        }
        assert_eq!(
            events[1].to_bus_event(0, 0).event_type,
            EventType::PatternChange
        );
        assert!(!m.is_listening());
    }

    #[test]
    fn test_stop_without_phrase_only_stops() {
        let mut m = machine(Mode::ChordFollow);
        m.on_listening_start();
        m.process(&frame(0, 0.0, false));
        assert_eq!(kinds(&m.on_listening_stop()), vec!["listening_stopped"]);
        assert!(m.on_listening_stop().is_empty());
    }

    #[test]
    fn test_start_resets_session() {
        let mut m = machine(Mode::ChordFollow);
        m.on_listening_start();
        m.process(&chord_frame(0, 0));
        m.on_listening_stop();

        m.on_listening_start();
        assert_eq!(m.status().current_chord, None);
        assert_eq!(m.status().phrase_frames, 0);
        // Same chord again is a change in the new session
        assert_eq!(kinds(&m.process(&chord_frame(100, 0))), vec!["chord"]);
    }

    #[test]
    fn test_mode_cycle_wraps_and_always_emits() {
        let mut m = machine(Mode::ChordFollow);
        let mut seen = Vec::new();
        for _ in 0..4 {
            match m.on_mode_cycle().as_slice() {
                [ListenerEvent::ModeChanged { to, .. }] => seen.push(*to),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                Mode::CallResponse,
                Mode::RhythmicSync,
                Mode::AmbientLayer,
                Mode::ChordFollow
            ]
        );

        let mut off = machine(Mode::Off);
        assert_eq!(
            off.on_mode_cycle(),
            vec![ListenerEvent::ModeChanged {
                from: Mode::Off,
                to: Mode::ChordFollow
            }]
        );
    }

    #[test]
    fn test_mode_cycle_with_no_modes_stays_put() {
        let settings = ListenerSettings {
            initial_mode: Mode::RhythmicSync,
            modes: Vec::new(),
            ..Default::default()
        };
        let mut m = ModeStateMachine::with_rng(settings, StdRng::seed_from_u64(7));
        assert!(m.on_mode_cycle().is_empty());
        assert_eq!(m.mode(), Mode::RhythmicSync);
    }

    #[test]
    fn test_expression_threshold_is_inverse() {
        let mut m = machine(Mode::ChordFollow);
        match m.on_expression(0.0).as_slice() {
            [ListenerEvent::ExpressionControl { threshold, .. }] => {
                assert!((threshold - 0.25).abs() < 1e-6)
            }
            other => panic!("unexpected {other:?}"),
        }
        m.on_expression(1.0);
        assert!((m.status().response_threshold - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_tap_tempo_updates_session() {
        let mut m = machine(Mode::RhythmicSync);
        assert!(m.on_tap(0).is_empty());
        m.on_tap(500 * MS);
        let events = m.on_tap(1000 * MS);
        match events.as_slice() {
            [ListenerEvent::TempoTap { bpm, confidence }] => {
                assert!((bpm - 120.0).abs() < 0.01);
                assert!(*confidence >= 1.0 / 3.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!((m.tempo() - 120.0).abs() < 0.01);
    }

    #[test]
    fn test_rhythmic_sync_measures_tempo_after_five_onsets() {
        let mut m = machine(Mode::RhythmicSync);
        m.on_listening_start();

        let mut last = Vec::new();
        for i in 0..6u64 {
            let events = m.process(&frame(i * 400, 0.5, true));
            assert_eq!(kinds(&events), vec!["rhythm_sync", "tempo_update"]);
            last = events;
        }
        match &last[1] {
            ListenerEvent::TempoUpdate { bpm, confidence } => {
                assert!((bpm - 150.0).abs() < 0.01);
                assert_eq!(*confidence, 0.7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rhythmic_sync_low_confidence_early() {
        let mut m = machine(Mode::RhythmicSync);
        m.on_listening_start();
        let events = m.process(&frame(0, 0.5, true));
        assert_eq!(
            events[1],
            ListenerEvent::TempoUpdate {
                bpm: 120.0,
                confidence: 0.3
            }
        );
        assert!(m.process(&frame(10, 0.5, false)).is_empty());
    }

    #[test]
    fn test_median_tempo_clamped() {
        let fast: VecDeque<u64> = (0..6).map(|i| i * 100 * MS).collect();
        assert_eq!(median_tempo(&fast), Some(240.0));
        let slow: VecDeque<u64> = (0..6).map(|i| i * 3000 * MS).collect();
        assert_eq!(median_tempo(&slow), Some(40.0));
    }

    #[test]
    fn test_call_response_detects_call_after_pause() {
        let settings = ListenerSettings {
            initial_mode: Mode::CallResponse,
            responsiveness: 1.0,
            ..Default::default()
        };
        let mut m = ModeStateMachine::with_rng(settings, StdRng::seed_from_u64(1));
        m.on_listening_start();

        assert!(m.process(&frame(0, 0.4, true)).is_empty());
        assert!(m.process(&frame(100, 0.3, true)).is_empty());
        // Silence does not extend the phrase
        assert!(m.process(&frame(300, 0.0, false)).is_empty());

        let events = m.process(&frame(900, 0.5, true));
        match events.as_slice() {
            [ListenerEvent::CallDetected { phrase, respond }] => {
                assert!(*respond);
                assert_eq!(phrase.note_count, 2);
                assert_eq!(phrase.phrase_type, PhraseType::ShortMotif);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.status().phrase_frames, 1);
    }

    #[test]
    fn test_call_response_never_responds_at_zero() {
        let settings = ListenerSettings {
            initial_mode: Mode::CallResponse,
            responsiveness: 0.0,
            ..Default::default()
        };
        let mut m = ModeStateMachine::with_rng(settings, StdRng::seed_from_u64(1));
        m.on_listening_start();
        m.process(&frame(0, 0.4, true));
        let events = m.process(&frame(1000, 0.4, true));
        assert!(matches!(
            events.as_slice(),
            [ListenerEvent::CallDetected { respond: false, .. }]
        ));
    }

    #[test]
    fn test_short_gap_continues_phrase() {
        let mut m = machine(Mode::CallResponse);
        m.on_listening_start();
        m.process(&frame(0, 0.4, true));
        assert!(m.process(&frame(200, 0.4, true)).is_empty());
        assert_eq!(m.status().phrase_frames, 2);
    }

    #[test]
    fn test_ambient_layer_every_frame() {
        let mut m = machine(Mode::AmbientLayer);
        m.on_listening_start();
        m.process(&frame(0, 0.2, false));
        let events = m.process(&AnalysisResult {
            pitch_hz: Some(220.0),
            ..frame(10, 0.4, false)
        });
        assert_eq!(
            events,
            vec![
                ListenerEvent::AmbientLayer {
                    intensity: 0.4,
                    center_pitch: Some(220.0),
                    harmony: None
                },
                ListenerEvent::DensityControl {
                    target_density: (0.2 + 0.4) / 2.0,
                    fade_time_s: 2.0
                }
            ]
        );
    }

    #[test]
    fn test_phrase_types() {
        let frames = |onsets: usize, span_ms: u64| -> Vec<PhraseFrame> {
            (0..onsets.max(2))
                .map(|i| PhraseFrame {
                    timestamp_ns: if i == 0 { 0 } else { span_ms * MS },
                    pitch_hz: None,
                    dynamics: 0.5,
                    onset: i < onsets,
                    chord: None,
                })
                .collect()
        };
        let kind = |f: Vec<PhraseFrame>| analyze_phrase(&f).unwrap().phrase_type;
        assert_eq!(kind(frames(1, 100)), PhraseType::SingleNote);
        assert_eq!(kind(frames(3, 100)), PhraseType::ShortMotif);
        assert_eq!(kind(frames(5, 1000)), PhraseType::FastRun);
        assert_eq!(kind(frames(5, 3000)), PhraseType::MelodicPhrase);
        assert!(analyze_phrase(&[]).is_none());
    }

    #[test]
    fn test_bus_encoding() {
        let chord = ListenerEvent::Chord {
            chord: ChordLabel::new(9, ChordQuality::Minor),
            previous: None,
            tones: vec![69, 72, 76],
            confidence: 0.8,
        };
        let event = chord.to_bus_event(3, 1234);
        assert_eq!(event.event_type, EventType::Chord);
        assert_eq!(event.agent_id, 3);
        assert_eq!(event.timestamp_ns, 1234);
        assert_eq!(event.pitch, 69.0);
        assert_eq!(event.velocity, 0.8);
        assert_eq!(ChordLabel::unpack(event.reserved), Some(ChordLabel::new(9, ChordQuality::Minor)));
        assert!(event.flags.contains(EventFlags::FROM_INPUT | EventFlags::NEEDS_SYNTH));

        let started = ListenerEvent::ListeningStarted {
            mode: Mode::RhythmicSync,
        }
        .to_bus_event(0, 0);
        assert_eq!(started.event_type, EventType::System);
        assert_eq!(SystemCode::from_u64(started.reserved), Some(SystemCode::ListeningStarted));
        assert_eq!(started.pitch, 3.0);
        assert!(started.flags.contains(EventFlags::FROM_INPUT));
        assert!(!started.flags.contains(EventFlags::NEEDS_SYNTH));

        let tempo = ListenerEvent::TempoTap {
            bpm: 96.0,
            confidence: 1.0,
        }
        .to_bus_event(0, 0);
        assert_eq!(tempo.event_type, EventType::TempoChange);
        assert_eq!(tempo.pitch, 96.0);
    }

    #[test]
    fn test_listener_event_serde_tags() {
        let json = serde_json::to_string(&ListenerEvent::ModeChanged {
            from: Mode::ChordFollow,
            to: Mode::CallResponse,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"kind":"mode_changed","from":"chord_follow","to":"call_response"}"#
        );
        let back: ListenerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "mode_changed");
    }

    #[test]
    fn test_settings_skip_unknown_modes() {
        let config = ListenerConfig {
            modes: vec!["ambient_layer".into(), "bogus".into(), "chord_follow".into()],
            initial_mode: "ambient_layer".into(),
            ..Default::default()
        };
        let settings = ListenerSettings::from_config(&config);
        assert_eq!(settings.modes, vec![Mode::AmbientLayer, Mode::ChordFollow]);
        assert_eq!(settings.initial_mode, Mode::AmbientLayer);
        assert_eq!(settings.pause_ns, 500 * MS);
    }
}
