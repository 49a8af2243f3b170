//! Two handles on one segment, the way separate processes see it.

use perfbus::{BusError, BusFull, Event, EventBus, EventFlags, EventType, MAGIC, MAX_EVENTS, MAX_READERS};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn chord(root: f32, confidence: f32) -> Event {
    Event::now(4, EventType::Chord)
        .with_pitch(root)
        .with_velocity(confidence)
        .with_duration_ms(120)
        .with_flags(EventFlags::FROM_INPUT | EventFlags::NEEDS_SYNTH)
        .with_reserved(0x0107)
}

#[test]
fn attach_missing_segment_is_not_found() {
    let dir = TempDir::new().unwrap();
    let err = EventBus::attach_in(dir.path(), "absent").unwrap_err();
    assert!(matches!(err, BusError::NotFound(_)));
}

#[test]
fn attach_with_wrong_magic_is_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let owner = EventBus::create_in(dir.path(), "magic", 16).unwrap();

    let mut bytes = std::fs::read(owner.path()).unwrap();
    bytes[0..8].copy_from_slice(&0x1234u64.to_le_bytes());
    std::fs::write(owner.path(), &bytes).unwrap();

    match EventBus::attach_in(dir.path(), "magic").unwrap_err() {
        BusError::VersionMismatch { magic, version } => {
            assert_eq!(magic, 0x1234);
            assert_eq!(version, 1);
        }
        other => panic!("expected VersionMismatch, got {other:?}"),
    }
}

#[test]
fn attach_with_bad_event_size_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let owner = EventBus::create_in(dir.path(), "size", 16).unwrap();

    let mut bytes = std::fs::read(owner.path()).unwrap();
    bytes[24..28].copy_from_slice(&64u32.to_le_bytes());
    std::fs::write(owner.path(), &bytes).unwrap();

    assert!(matches!(
        EventBus::attach_in(dir.path(), "size").unwrap_err(),
        BusError::Corrupt(_)
    ));
}

#[test]
fn attach_truncated_segment_is_corrupt() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("short"), [0u8; 100]).unwrap();
    assert!(matches!(
        EventBus::attach_in(dir.path(), "short").unwrap_err(),
        BusError::Corrupt(_)
    ));
}

#[test]
fn round_trip_is_byte_identical_for_every_reader() {
    let dir = TempDir::new().unwrap();
    let owner = EventBus::create_in(dir.path(), "roundtrip", 64).unwrap();
    let reader = EventBus::attach_in(dir.path(), "roundtrip").unwrap();

    let written = vec![chord(60.0, 0.9), chord(67.0, 0.75), chord(65.0, 0.61)];
    for event in &written {
        owner.write(event).unwrap();
    }

    for slot in 0..perfbus::MAX_READERS {
        let read = reader.read(slot, 10).unwrap();
        assert_eq!(read.len(), written.len());
        for (a, b) in written.iter().zip(&read) {
            assert_eq!(a.encode(), b.encode());
        }
    }
}

#[test]
fn raw_segment_matches_documented_layout() {
    let dir = TempDir::new().unwrap();
    let owner = EventBus::create_in(dir.path(), "layout", MAX_EVENTS).unwrap();
    let event = chord(62.0, 0.5);
    owner.write(&event).unwrap();
    owner.write(&event).unwrap();
    owner.flush().unwrap();

    let bytes = std::fs::read(owner.path()).unwrap();
    assert_eq!(bytes.len(), 1024 * 1024);
    assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), MAGIC);
    assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 2);
    assert_eq!(u32::from_le_bytes(bytes[24..28].try_into().unwrap()), 32);
    assert_eq!(u32::from_le_bytes(bytes[28..32].try_into().unwrap()), 32760);
    assert_eq!(u32::from_le_bytes(bytes[32..36].try_into().unwrap()), 1024 * 1024);
    assert_eq!(u32::from_le_bytes(bytes[36..40].try_into().unwrap()), 2);
    assert_eq!(&bytes[256..288], &event.encode());
    assert_eq!(&bytes[288..320], &event.encode());
}

#[test]
fn only_owner_destroys() {
    let dir = TempDir::new().unwrap();
    let owner = EventBus::create_in(dir.path(), "owned", 16).unwrap();
    let attached = EventBus::attach_in(dir.path(), "owned").unwrap();

    assert!(matches!(attached.destroy(), Err(BusError::NotOwner)));
    assert!(owner.path().exists());

    let path = owner.path().to_path_buf();
    owner.destroy().unwrap();
    assert!(!path.exists());
}

#[test]
fn create_or_replace_recovers_stale_segment() {
    let dir = TempDir::new().unwrap();
    let stale = EventBus::create_in(dir.path(), "stale", 16).unwrap();
    stale.write(&chord(60.0, 1.0)).unwrap();
    stale.detach();

    let fresh = EventBus::create_or_replace_in(dir.path(), "stale", 16).unwrap();
    assert_eq!(fresh.write_position(), 0);
    assert_eq!(fresh.pending(0).unwrap(), 0);
}

#[test]
fn concurrent_reader_sees_monotonic_ordered_stream() {
    const TOTAL: u32 = 20_000;

    let dir = TempDir::new().unwrap();
    let owner = Arc::new(EventBus::create_in(dir.path(), "stream", 256).unwrap());
    let reader = EventBus::attach_in(dir.path(), "stream").unwrap();
    reader.register_reader(0).unwrap();

    let writer = {
        let owner = Arc::clone(&owner);
        thread::spawn(move || {
            let mut next = 0u32;
            while next < TOTAL {
                let event = Event::at(next as u64, 1, EventType::NoteOn).with_reserved(next as u64);
                if owner.write(&event).is_ok() {
                    next += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    let mut expected = 0u64;
    let mut last_position = 0u64;
    while expected < TOTAL as u64 {
        // No other consumers in this process; keep their slots out of the way
        for slot in 1..MAX_READERS {
            reader.reset_reader(slot).unwrap();
        }
        for event in reader.read(0, 64).unwrap() {
            assert_eq!(event.reserved, expected);
            expected += 1;
        }
        let position = reader.read_position(0).unwrap();
        assert!(position >= last_position);
        assert!(position <= owner.write_position() as u64);
        last_position = position;
    }

    writer.join().unwrap();
    assert_eq!(owner.stats().writes, TOTAL as u64);
}

#[test]
fn unregistered_reader_is_never_lapped() {
    let dir = TempDir::new().unwrap();
    let owner = EventBus::create_in(dir.path(), "lapped", 8).unwrap();
    let monitor = EventBus::attach_in(dir.path(), "lapped").unwrap();
    let synth = EventBus::attach_in(dir.path(), "lapped").unwrap();
    monitor.register_reader(4).unwrap();

    // The monitor drains after every write; slot 0 never reads
    let mut accepted = 0u32;
    for i in 0..20u64 {
        match owner.write(&chord(60.0, 0.5).with_reserved(i)) {
            Ok(()) => accepted += 1,
            Err(BusFull) => {}
        }
        monitor.read(4, 16).unwrap();
    }
    assert_eq!(accepted, 7);
    assert_eq!(owner.stats().drops, 13);

    let backlog: Vec<u64> = synth
        .read(0, 64)
        .unwrap()
        .iter()
        .map(|e| e.reserved)
        .collect();
    assert_eq!(backlog, (0..7).collect::<Vec<u64>>());

    // Once the idle slots are caught up the writer has room again
    for slot in 1..4 {
        synth.reset_reader(slot).unwrap();
    }
    owner.write(&chord(62.0, 0.5)).unwrap();
}
