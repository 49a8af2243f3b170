//! Chroma template matching with recency-weighted smoothing.

use perfconf::ChordsConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChordError {
    #[error("chroma must have 12 elements, got {0}")]
    WrongLength(usize),

    #[error("unrecognized chord symbol '{0}'")]
    BadSymbol(String),
}

/// Chord quality, in template order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordQuality {
    Major,
    Major7,
    Major9,
    Major6,
    Add9,
    Minor,
    Minor7,
    Minor9,
    Minor6,
    Dominant7,
    Dominant9,
    Dominant13,
    Suspended2,
    Suspended4,
    Dominant7Sus4,
    Diminished,
    Diminished7,
    Augmented,
    HalfDiminished7,
}

impl ChordQuality {
    pub fn suffix(self) -> &'static str {
        self.template().suffix
    }

    /// Semitones above the root.
    pub fn intervals(self) -> Vec<u8> {
        let mask = self.template().intervals;
        (0..12).filter(|i| mask & (1 << i) != 0).collect()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        TEMPLATES.get(index as usize).map(|t| t.quality)
    }

    /// Minor third above the root.
    pub fn is_minor(self) -> bool {
        let mask = self.template().intervals;
        mask & (1 << 3) != 0 && mask & (1 << 4) == 0
    }

    fn template(self) -> &'static ChordTemplate {
        &TEMPLATES[self as usize]
    }
}

/// Quality + interval set from the root as a bitmask over 12 pitch classes.
pub struct ChordTemplate {
    pub quality: ChordQuality,
    pub suffix: &'static str,
    pub intervals: u16,
    pub size: usize,
}

impl ChordTemplate {
    const fn new(quality: ChordQuality, suffix: &'static str, intervals: &[u8]) -> Self {
        let mut mask = 0u16;
        let mut i = 0;
        while i < intervals.len() {
            mask |= 1 << intervals[i];
            i += 1;
        }
        Self {
            quality,
            suffix,
            intervals: mask,
            size: intervals.len(),
        }
    }

    /// Dot product of a unit chroma with this template (unit-normalized)
    /// rotated to `root`.
    fn score(&self, chroma: &[f32; 12], root: usize) -> f32 {
        let mut sum = 0.0;
        for (interval, value) in chroma.iter().cycle().skip(root).take(12).enumerate() {
            if self.intervals & (1 << interval) != 0 {
                sum += value;
            }
        }
        sum / (self.size as f32).sqrt()
    }
}

/// Indexed by `ChordQuality as usize`.
pub static TEMPLATES: &[ChordTemplate] = &[
    ChordTemplate::new(ChordQuality::Major, "", &[0, 4, 7]),
    ChordTemplate::new(ChordQuality::Major7, "maj7", &[0, 4, 7, 11]),
    ChordTemplate::new(ChordQuality::Major9, "maj9", &[0, 2, 4, 7, 11]),
    ChordTemplate::new(ChordQuality::Major6, "6", &[0, 4, 7, 9]),
    ChordTemplate::new(ChordQuality::Add9, "add9", &[0, 2, 4, 7]),
    ChordTemplate::new(ChordQuality::Minor, "m", &[0, 3, 7]),
    ChordTemplate::new(ChordQuality::Minor7, "m7", &[0, 3, 7, 10]),
    ChordTemplate::new(ChordQuality::Minor9, "m9", &[0, 2, 3, 7, 10]),
    ChordTemplate::new(ChordQuality::Minor6, "m6", &[0, 3, 7, 9]),
    ChordTemplate::new(ChordQuality::Dominant7, "7", &[0, 4, 7, 10]),
    ChordTemplate::new(ChordQuality::Dominant9, "9", &[0, 2, 4, 7, 10]),
    ChordTemplate::new(ChordQuality::Dominant13, "13", &[0, 2, 4, 7, 9, 10]),
    ChordTemplate::new(ChordQuality::Suspended2, "sus2", &[0, 2, 7]),
    ChordTemplate::new(ChordQuality::Suspended4, "sus4", &[0, 5, 7]),
    ChordTemplate::new(ChordQuality::Dominant7Sus4, "7sus4", &[0, 5, 7, 10]),
    ChordTemplate::new(ChordQuality::Diminished, "dim", &[0, 3, 6]),
    ChordTemplate::new(ChordQuality::Diminished7, "dim7", &[0, 3, 6, 9]),
    ChordTemplate::new(ChordQuality::Augmented, "aug", &[0, 4, 8]),
    ChordTemplate::new(ChordQuality::HalfDiminished7, "m7b5", &[0, 3, 6, 10]),
];

const NOTE_NAMES_SHARP: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

pub fn note_name(pitch_class: u8) -> &'static str {
    NOTE_NAMES_SHARP[(pitch_class % 12) as usize]
}

/// Root pitch class (C = 0) and quality, e.g. `Am7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChordLabel {
    pub root: u8,
    pub quality: ChordQuality,
}

impl ChordLabel {
    pub fn new(root: u8, quality: ChordQuality) -> Self {
        Self {
            root: root % 12,
            quality,
        }
    }

    /// MIDI notes in the octave above middle C.
    pub fn tones(&self) -> Vec<u8> {
        self.quality
            .intervals()
            .into_iter()
            .map(|i| 60 + self.root + i)
            .collect()
    }

    /// `quality << 8 | root`, as carried in a bus event's reserved field.
    pub fn pack(&self) -> u64 {
        ((self.quality.index() as u64) << 8) | self.root as u64
    }

    pub fn unpack(value: u64) -> Option<Self> {
        let quality = ChordQuality::from_index(((value >> 8) & 0xFF) as u8)?;
        let root = (value & 0xFF) as u8;
        (root < 12).then(|| Self::new(root, quality))
    }

    fn transpose(&self, semitones: u8, quality: ChordQuality) -> Self {
        Self::new(self.root + semitones, quality)
    }
}

impl fmt::Display for ChordLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", note_name(self.root), self.quality.suffix())
    }
}

impl FromStr for ChordLabel {
    type Err = ChordError;

    /// Accepts `C`, `Cmaj`, `F#m7`, `Bbmaj7`. A bare root means major.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ChordError::BadSymbol(s.to_string());
        let mut chars = s.chars();
        let letter = chars.next().ok_or_else(bad)?;
        let natural: u8 = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(bad()),
        };

        let rest = chars.as_str();
        let (root, suffix) = if let Some(r) = rest.strip_prefix('#') {
            ((natural + 1) % 12, r)
        } else if let Some(r) = rest.strip_prefix('b') {
            ((natural + 11) % 12, r)
        } else {
            (natural, rest)
        };

        let quality = if suffix.is_empty() || suffix == "maj" {
            ChordQuality::Major
        } else {
            TEMPLATES
                .iter()
                .find(|t| t.suffix == suffix)
                .map(|t| t.quality)
                .ok_or_else(bad)?
        };
        Ok(Self::new(root, quality))
    }
}

/// MIDI chord tones for `label`.
pub fn chord_tones(label: &ChordLabel) -> Vec<u8> {
    label.tones()
}

/// Likely next chords by diatonic function, with rough probabilities.
///
/// Major-family chords lean to V, IV and vi; minor-family chords to III, iv
/// and VII. Not used on the real-time path.
pub fn suggest_next_chord(current: &ChordLabel) -> Vec<(ChordLabel, f32)> {
    use ChordQuality::*;

    let stay = (*current, 0.2);
    match current.quality {
        Diminished | Diminished7 | HalfDiminished7 => vec![
            (current.transpose(1, Major), 0.5),
            (current.transpose(1, Minor), 0.3),
            stay,
        ],
        q if q.is_minor() => vec![
            (current.transpose(3, Major), 0.3),
            (current.transpose(5, Minor), 0.3),
            (current.transpose(10, Major), 0.2),
            stay,
        ],
        _ => vec![
            (current.transpose(7, Dominant7), 0.3),
            (current.transpose(5, Major), 0.3),
            (current.transpose(9, Minor), 0.2),
            stay,
        ],
    }
}

/// Best template match over every quality and root, plus a short history
/// for temporal smoothing.
#[derive(Debug, Clone)]
pub struct ChordDetector {
    history: VecDeque<(ChordLabel, f32)>,
    capacity: usize,
    smoothing: bool,
}

impl Default for ChordDetector {
    fn default() -> Self {
        Self::new(4, true)
    }
}

impl ChordDetector {
    pub fn new(history: usize, smoothing: bool) -> Self {
        let capacity = history.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            smoothing,
        }
    }

    pub fn from_config(config: &ChordsConfig) -> Self {
        Self::new(config.history, config.smoothing)
    }

    /// Label and score for this frame, smoothed over the history when enabled.
    ///
    /// The smoothed label is the one with the greatest recency-weighted score
    /// across the history, which may differ from this frame's best match.
    pub fn detect(&mut self, chroma: &[f32]) -> Result<(ChordLabel, f32), ChordError> {
        let (label, score) = self.detect_raw(chroma)?;

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((label, score));

        if !self.smoothing {
            return Ok((label, score));
        }
        Ok(self.smoothed())
    }

    /// Best match for `chroma` alone. History is untouched.
    pub fn detect_raw(&self, chroma: &[f32]) -> Result<(ChordLabel, f32), ChordError> {
        let chroma: &[f32; 12] = chroma
            .try_into()
            .map_err(|_| ChordError::WrongLength(chroma.len()))?;

        let mut unit = *chroma;
        crate::dsp::normalize_l2(&mut unit);

        let mut best = (ChordLabel::new(0, ChordQuality::Major), f32::NEG_INFINITY);
        for template in TEMPLATES {
            for root in 0..12 {
                let score = template.score(&unit, root);
                if score > best.1 {
                    best = (ChordLabel::new(root as u8, template.quality), score);
                }
            }
        }
        Ok(best)
    }

    fn smoothed(&self) -> (ChordLabel, f32) {
        let len = self.history.len() as f32;
        let mut totals: Vec<(ChordLabel, f32)> = Vec::with_capacity(self.history.len());
        let mut total_weight = 0.0;

        for (i, (label, score)) in self.history.iter().enumerate() {
            let weight = (i + 1) as f32 / len;
            total_weight += weight;
            match totals.iter_mut().find(|(l, _)| l == label) {
                Some((_, sum)) => *sum += score * weight,
                None => totals.push((*label, score * weight)),
            }
        }

        // Earliest-seen label wins ties
        let mut best = totals[0];
        for &(label, sum) in &totals[1..] {
            if sum > best.1 {
                best = (label, sum);
            }
        }
        (best.0, best.1 / total_weight)
    }

    pub fn history(&self) -> impl Iterator<Item = &(ChordLabel, f32)> {
        self.history.iter()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}
