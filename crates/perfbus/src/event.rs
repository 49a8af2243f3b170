//! Fixed 32-byte event record shared by every bus participant.
//!
//! ## Wire Format
//!
//! Little-endian, no implicit padding:
//!
//! ```text
//! offset  size  field
//!      0     8  timestamp_ns  u64
//!      8     1  agent_id      u8
//!      9     1  event_type    u8
//!     10     2  (padding)     always zero
//!     12     4  pitch         f32  MIDI note or Hz, per event type
//!     16     4  velocity      f32  0.0..=1.0
//!     20     2  duration_ms   u16
//!     22     2  flags         u16  EventFlags bitset
//!     24     8  reserved      u64  per-type payload
//! ```
//!
//! Other language bindings read the same record with the struct format
//! `<QBBHffHHQ`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Size of one record in bytes.
pub const EVENT_SIZE: usize = 32;

/// Errors decoding a record read from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("unknown event type {0}")]
    UnknownEventType(u8),
}

/// Musical event kinds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    NoteOn = 1,
    NoteOff = 2,
    PatternChange = 3,
    ControlChange = 4,
    TempoChange = 5,
    KeyChange = 6,
    Onset = 7,
    Pitch = 8,
    Chord = 9,
    System = 10,
}

impl EventType {
    /// Parse a wire byte into an EventType
    pub fn from_u8(value: u8) -> Result<Self, EventError> {
        match value {
            1 => Ok(EventType::NoteOn),
            2 => Ok(EventType::NoteOff),
            3 => Ok(EventType::PatternChange),
            4 => Ok(EventType::ControlChange),
            5 => Ok(EventType::TempoChange),
            6 => Ok(EventType::KeyChange),
            7 => Ok(EventType::Onset),
            8 => Ok(EventType::Pitch),
            9 => Ok(EventType::Chord),
            10 => Ok(EventType::System),
            other => Err(EventError::UnknownEventType(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NoteOn => "NOTE_ON",
            EventType::NoteOff => "NOTE_OFF",
            EventType::PatternChange => "PATTERN_CHANGE",
            EventType::ControlChange => "CONTROL_CHANGE",
            EventType::TempoChange => "TEMPO_CHANGE",
            EventType::KeyChange => "KEY_CHANGE",
            EventType::Onset => "ONSET",
            EventType::Pitch => "PITCH",
            EventType::Chord => "CHORD",
            EventType::System => "SYSTEM",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event metadata bitset.
///
/// URGENT and BROADCAST are reserved: they travel on the wire but no reader
/// changes behaviour because of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFlags(u16);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const URGENT: EventFlags = EventFlags(1 << 0);
    pub const BROADCAST: EventFlags = EventFlags(1 << 1);
    pub const NEEDS_SYNTH: EventFlags = EventFlags(1 << 2);
    pub const FROM_INPUT: EventFlags = EventFlags(1 << 3);
    pub const PATTERN_START: EventFlags = EventFlags(1 << 4);
    pub const PATTERN_END: EventFlags = EventFlags(1 << 5);

    const NAMED: [(EventFlags, &'static str); 6] = [
        (Self::URGENT, "URGENT"),
        (Self::BROADCAST, "BROADCAST"),
        (Self::NEEDS_SYNTH, "NEEDS_SYNTH"),
        (Self::FROM_INPUT, "FROM_INPUT"),
        (Self::PATTERN_START, "PATTERN_START"),
        (Self::PATTERN_END, "PATTERN_END"),
    ];

    /// Keeps unknown bits so records round-trip untouched.
    pub const fn from_bits(bits: u16) -> Self {
        EventFlags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names of the set flags, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        f.write_str(&self.names().join("|"))
    }
}

/// One timestamped musical event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Wall-clock nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub agent_id: u8,
    pub event_type: EventType,
    pub pitch: f32,
    pub velocity: f32,
    pub duration_ms: u16,
    pub flags: EventFlags,
    pub reserved: u64,
}

impl Event {
    /// A zeroed event of the given type, stamped with the current time.
    pub fn now(agent_id: u8, event_type: EventType) -> Self {
        Self::at(now_ns(), agent_id, event_type)
    }

    pub fn at(timestamp_ns: u64, agent_id: u8, event_type: EventType) -> Self {
        Self {
            timestamp_ns,
            agent_id,
            event_type,
            pitch: 0.0,
            velocity: 0.0,
            duration_ms: 0,
            flags: EventFlags::NONE,
            reserved: 0,
        }
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u16) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_reserved(mut self, reserved: u64) -> Self {
        self.reserved = reserved;
        self
    }

    /// Encode to the 32-byte wire record.
    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut out = [0u8; EVENT_SIZE];
        out[0..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[8] = self.agent_id;
        out[9] = self.event_type.to_u8();
        // 10..12 stays zero
        out[12..16].copy_from_slice(&self.pitch.to_le_bytes());
        out[16..20].copy_from_slice(&self.velocity.to_le_bytes());
        out[20..22].copy_from_slice(&self.duration_ms.to_le_bytes());
        out[22..24].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[24..32].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    /// Decode a 32-byte wire record. The padding bytes are ignored.
    pub fn decode(bytes: &[u8; EVENT_SIZE]) -> Result<Self, EventError> {
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let f32_at = |at: usize| f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);

        Ok(Self {
            timestamp_ns: u64_at(0),
            agent_id: bytes[8],
            event_type: EventType::from_u8(bytes[9])?,
            pitch: f32_at(12),
            velocity: f32_at(16),
            duration_ms: u16_at(20),
            flags: EventFlags::from_bits(u16_at(22)),
            reserved: u64_at(24),
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} agent={} {} pitch={:.2} vel={:.2} dur={}ms flags={} reserved={:#x}",
            self.timestamp_ns,
            self.agent_id,
            self.event_type,
            self.pitch,
            self.velocity,
            self.duration_ms,
            self.flags,
            self.reserved
        )
    }
}

/// Wall-clock nanoseconds since the Unix epoch, the timestamp base shared by all bus processes.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let event = Event::at(0x0102_0304_0506_0708, 7, EventType::Chord)
            .with_pitch(60.0)
            .with_velocity(0.5)
            .with_duration_ms(250)
            .with_flags(EventFlags::FROM_INPUT | EventFlags::NEEDS_SYNTH)
            .with_reserved(0xAABB);

        let bytes = event.encode();
        assert_eq!(&bytes[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[8], 7);
        assert_eq!(bytes[9], 9);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[12..16], &60.0f32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[20..22], &250u16.to_le_bytes());
        assert_eq!(&bytes[22..24], &0b1100u16.to_le_bytes());
        assert_eq!(&bytes[24..32], &0xAABBu64.to_le_bytes());
    }

    #[test]
    fn test_decode_matches_encode() {
        let event = Event::now(3, EventType::TempoChange).with_pitch(128.5);
        assert_eq!(Event::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = Event::now(0, EventType::System).encode();
        bytes[9] = 42;
        assert_eq!(Event::decode(&bytes), Err(EventError::UnknownEventType(42)));
    }

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::NoteOn.to_u8(), 1);
        assert_eq!(EventType::System.to_u8(), 10);
        assert_eq!(EventType::from_u8(9).unwrap(), EventType::Chord);
        assert!(EventType::from_u8(0).is_err());
    }

    #[test]
    fn test_flags_keep_unknown_bits() {
        let flags = EventFlags::from_bits(0x8001);
        assert!(flags.contains(EventFlags::URGENT));
        assert_eq!(flags.bits(), 0x8001);
        assert_eq!(flags.names(), vec!["URGENT"]);
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(EventFlags::NONE.to_string(), "-");
        assert_eq!(
            (EventFlags::FROM_INPUT | EventFlags::PATTERN_END).to_string(),
            "FROM_INPUT|PATTERN_END"
        );
    }
}
