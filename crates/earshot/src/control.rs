//! Pedal board input: raw MIDI bytes to listener control inputs.
//!
//! The sustain pedal opens and closes a listening session, the mode pedal
//! cycles modes, the expression pedal sets sensitivity and a spare switch
//! taps tempo. CC numbers come from `[pedals]` in the config.

use perfconf::PedalsConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Pedal values above this count as pressed.
pub const PRESS_THRESHOLD: u8 = 63;

/// Taps remembered for tempo averaging.
const MAX_TAPS: usize = 8;

/// The MIDI messages a pedal board can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiMessage {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    Other { status: u8 },
}

/// Parse raw MIDI bytes. Returns `None` for empty or truncated messages.
pub fn parse_midi_bytes(data: &[u8]) -> Option<MidiMessage> {
    let (&status, rest) = data.split_first()?;
    let channel = status & 0x0F;

    match status & 0xF0 {
        0x90 if rest.len() >= 2 => {
            if rest[1] == 0 {
                // Note On with velocity 0 is Note Off
                Some(MidiMessage::NoteOff {
                    channel,
                    pitch: rest[0],
                })
            } else {
                Some(MidiMessage::NoteOn {
                    channel,
                    pitch: rest[0],
                    velocity: rest[1],
                })
            }
        }
        0x80 if rest.len() >= 2 => Some(MidiMessage::NoteOff {
            channel,
            pitch: rest[0],
        }),
        0xB0 if rest.len() >= 2 => Some(MidiMessage::ControlChange {
            channel,
            controller: rest[0],
            value: rest[1],
        }),
        0x80 | 0x90 | 0xB0 => None,
        _ => Some(MidiMessage::Other { status }),
    }
}

/// Protocol-independent control events consumed by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlInput {
    ListenStart,
    ListenStop,
    ModeCycle,
    /// 0..1, continuous.
    Expression { value: f32 },
    /// One tap-tempo press.
    Tap { timestamp_ns: u64 },
    /// Tempo decided elsewhere (e.g. a clock source).
    Tempo { bpm: f32 },
}

/// Maps control-change messages to control inputs, tracking pedal state so
/// switches act on the press edge only.
#[derive(Debug, Clone)]
pub struct PedalMap {
    pedals: PedalsConfig,
    sustain_down: bool,
    mode_down: bool,
    tap_down: bool,
}

impl PedalMap {
    pub fn new(pedals: PedalsConfig) -> Self {
        Self {
            pedals,
            sustain_down: false,
            mode_down: false,
            tap_down: false,
        }
    }

    pub fn map(&mut self, message: &MidiMessage, timestamp_ns: u64) -> Option<ControlInput> {
        let MidiMessage::ControlChange {
            controller, value, ..
        } = *message
        else {
            return None;
        };
        let pressed = value > PRESS_THRESHOLD;
        let p = &self.pedals;

        if controller == p.sustain {
            let was = std::mem::replace(&mut self.sustain_down, pressed);
            match (was, pressed) {
                (false, true) => Some(ControlInput::ListenStart),
                (true, false) => Some(ControlInput::ListenStop),
                _ => None,
            }
        } else if controller == p.mode {
            let was = std::mem::replace(&mut self.mode_down, pressed);
            (!was && pressed).then_some(ControlInput::ModeCycle)
        } else if controller == p.tap {
            let was = std::mem::replace(&mut self.tap_down, pressed);
            (!was && pressed).then_some(ControlInput::Tap { timestamp_ns })
        } else if controller == p.expression {
            Some(ControlInput::Expression {
                value: value as f32 / 127.0,
            })
        } else if controller == p.sostenuto || controller == p.soft {
            debug!("Pedal CC{} = {} (no action)", controller, value);
            None
        } else {
            warn!("Unmapped CC{} = {}", controller, value);
            None
        }
    }

    /// Parse and map in one step.
    pub fn map_bytes(&mut self, data: &[u8], timestamp_ns: u64) -> Option<ControlInput> {
        parse_midi_bytes(data).and_then(|msg| self.map(&msg, timestamp_ns))
    }
}

/// Tempo from a run of taps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TapEstimate {
    pub bpm: f32,
    /// `min(1, (taps - 1) / 3)`
    pub confidence: f32,
    pub taps: usize,
}

/// Bounded queue of recent taps. Taps older than the timeout are forgotten.
#[derive(Debug, Clone)]
pub struct TapTempo {
    taps: VecDeque<u64>,
    timeout_ns: u64,
}

impl TapTempo {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            taps: VecDeque::with_capacity(MAX_TAPS),
            timeout_ns: timeout_ms.saturating_mul(1_000_000),
        }
    }

    /// Record a tap. Returns an estimate once two or more taps are in range.
    pub fn tap(&mut self, timestamp_ns: u64) -> Option<TapEstimate> {
        while let Some(&oldest) = self.taps.front() {
            if timestamp_ns.saturating_sub(oldest) >= self.timeout_ns || oldest > timestamp_ns {
                self.taps.pop_front();
            } else {
                break;
            }
        }
        if self.taps.len() == MAX_TAPS {
            self.taps.pop_front();
        }
        self.taps.push_back(timestamp_ns);

        let n = self.taps.len();
        if n < 2 {
            return None;
        }
        let (first, last) = (self.taps[0], self.taps[n - 1]);
        let mean_interval_s = (last - first) as f64 / (n - 1) as f64 / 1e9;
        if mean_interval_s <= 0.0 {
            return None;
        }

        Some(TapEstimate {
            bpm: (60.0 / mean_interval_s) as f32,
            confidence: ((n - 1) as f32 / 3.0).min(1.0),
            taps: n,
        })
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn clear(&mut self) {
        self.taps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn cc(controller: u8, value: u8) -> [u8; 3] {
        [0xB0, controller, value]
    }

    #[test]
    fn test_parse_midi_bytes() {
        assert_eq!(
            parse_midi_bytes(&[0xB3, 64, 127]),
            Some(MidiMessage::ControlChange {
                channel: 3,
                controller: 64,
                value: 127
            })
        );
        assert_eq!(
            parse_midi_bytes(&[0x90, 60, 0]),
            Some(MidiMessage::NoteOff {
                channel: 0,
                pitch: 60
            })
        );
        assert_eq!(
            parse_midi_bytes(&[0xF8]),
            Some(MidiMessage::Other { status: 0xF8 })
        );
        assert_eq!(parse_midi_bytes(&[0xB0, 64]), None);
        assert_eq!(parse_midi_bytes(&[]), None);
    }

    #[test]
    fn test_sustain_is_edge_triggered() {
        let mut map = PedalMap::new(PedalsConfig::default());
        assert_eq!(map.map_bytes(&cc(64, 127), 0), Some(ControlInput::ListenStart));
        // Held: no repeat
        assert_eq!(map.map_bytes(&cc(64, 100), 0), None);
        assert_eq!(map.map_bytes(&cc(64, 0), 0), Some(ControlInput::ListenStop));
        assert_eq!(map.map_bytes(&cc(64, 10), 0), None);
    }

    #[test]
    fn test_mode_and_tap_act_on_press() {
        let mut map = PedalMap::new(PedalsConfig::default());
        assert_eq!(map.map_bytes(&cc(65, 127), 0), Some(ControlInput::ModeCycle));
        assert_eq!(map.map_bytes(&cc(65, 0), 0), None);
        assert_eq!(map.map_bytes(&cc(65, 64), 0), Some(ControlInput::ModeCycle));

        assert_eq!(
            map.map_bytes(&cc(80, 127), 42),
            Some(ControlInput::Tap { timestamp_ns: 42 })
        );
        assert_eq!(map.map_bytes(&cc(80, 127), 43), None);
    }

    #[test]
    fn test_expression_is_continuous() {
        let mut map = PedalMap::new(PedalsConfig::default());
        assert_eq!(
            map.map_bytes(&cc(11, 127), 0),
            Some(ControlInput::Expression { value: 1.0 })
        );
        assert_eq!(
            map.map_bytes(&cc(11, 0), 0),
            Some(ControlInput::Expression { value: 0.0 })
        );
    }

    #[test]
    fn test_configured_cc_numbers() {
        let pedals = PedalsConfig {
            sustain: 20,
            ..Default::default()
        };
        let mut map = PedalMap::new(pedals);
        assert_eq!(map.map_bytes(&cc(64, 127), 0), None);
        assert_eq!(map.map_bytes(&cc(20, 127), 0), Some(ControlInput::ListenStart));
    }

    #[test]
    fn test_unmapped_and_non_cc_ignored() {
        let mut map = PedalMap::new(PedalsConfig::default());
        assert_eq!(map.map_bytes(&cc(66, 127), 0), None);
        assert_eq!(map.map_bytes(&cc(1, 127), 0), None);
        assert_eq!(map.map_bytes(&[0x90, 60, 100], 0), None);
    }

    #[test]
    fn test_tap_tempo_120_bpm() {
        let mut taps = TapTempo::new(2000);
        assert_eq!(taps.tap(0), None);

        let two = taps.tap(500 * MS).unwrap();
        assert!((two.bpm - 120.0).abs() < 0.01);
        assert!((two.confidence - 1.0 / 3.0).abs() < 1e-6);

        let three = taps.tap(1000 * MS).unwrap();
        assert!((three.bpm - 120.0).abs() < 0.01);
        assert_eq!(three.taps, 3);
        assert!(three.confidence > two.confidence);
    }

    #[test]
    fn test_tap_timeout_forgets_old_taps() {
        let mut taps = TapTempo::new(2000);
        taps.tap(0);
        taps.tap(500 * MS);
        // Long gap: both earlier taps expire
        assert_eq!(taps.tap(3000 * MS), None);
        assert_eq!(taps.len(), 1);
    }

    #[test]
    fn test_tap_queue_is_bounded() {
        let mut taps = TapTempo::new(10_000);
        let mut last = None;
        for i in 0..20 {
            last = taps.tap(i * 250 * MS);
        }
        let est = last.unwrap();
        assert_eq!(est.taps, MAX_TAPS);
        assert!((est.bpm - 240.0).abs() < 0.01);
        assert_eq!(est.confidence, 1.0);
    }
}
