//! Shared-memory event ring - one writer process, up to five reader slots.
//!
//! The segment is a plain file under a tmpfs directory (`/dev/shm` by default),
//! mapped with memmap2 by every participant. All access to the mapped bytes
//! goes through atomics so concurrent processes never race on plain memory:
//!
//! - The writer stores a record as four `u64` words, then publishes it with a
//!   release store of the write cursor.
//! - A reader acquires the write cursor, copies the words out, then releases
//!   its own read cursor so the writer may reuse the slot.
//!
//! Only one process may write. Two writers on one segment corrupt the ring;
//! nothing here prevents it.

use crate::context::{ContextBlock, MusicalContext};
use crate::error::{BusError, BusFull};
use crate::event::{Event, EVENT_SIZE};
use crate::layout::{self, MAGIC, MAX_EVENTS, MAX_READERS, VERSION};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default tmpfs directory, where POSIX shared memory lives on Linux.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Whether this handle created the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusRole {
    Owner,
    Attached,
}

/// Counters local to this process plus a snapshot of the shared cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub writes: u64,
    pub reads: u64,
    pub drops: u64,
    /// Records skipped because their event type was unknown.
    pub invalid: u64,
    pub max_latency_ns: u64,
    pub write_position: u32,
    pub min_read_position: u32,
    pub events_pending: u32,
    /// `events_pending / capacity`
    pub buffer_usage: f64,
    pub sequence: u32,
    pub capacity: u32,
}

#[derive(Debug, Default)]
struct LocalCounters {
    writes: AtomicU64,
    reads: AtomicU64,
    drops: AtomicU64,
    invalid: AtomicU64,
    max_latency_ns: AtomicU64,
}

/// Handle on a mapped bus segment.
pub struct EventBus {
    name: String,
    path: PathBuf,
    role: BusRole,
    capacity: u32,
    base: NonNull<u8>,
    len: usize,
    counters: LocalCounters,
    // Keeps the mapping alive; all access goes through `base`.
    mmap: MmapMut,
}

// SAFETY: `base` points into `mmap`, which lives as long as the handle and is
// never remapped. Every read and write through `base` uses atomic types, so
// sharing the handle across threads cannot produce a data race.
unsafe impl Send for EventBus {}
unsafe impl Sync for EventBus {}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("role", &self.role)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a new segment under `/dev/shm`.
    pub fn create(name: &str, capacity: u32) -> Result<Self, BusError> {
        Self::create_in(Path::new(DEFAULT_SHM_DIR), name, capacity)
    }

    /// Create a new segment in `dir`. Fails if one with the same name exists.
    pub fn create_in(dir: &Path, name: &str, capacity: u32) -> Result<Self, BusError> {
        if !(2..=MAX_EVENTS).contains(&capacity) {
            return Err(BusError::InvalidCapacity(capacity));
        }

        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => BusError::AlreadyExists(path.clone()),
                _ => BusError::AllocationError {
                    path: path.clone(),
                    source: e,
                },
            })?;

        let len = layout::segment_len(capacity);
        // A fresh file extended with set_len reads back as zeros.
        let mmap = file
            .set_len(len as u64)
            .and_then(|_| unsafe { MmapOptions::new().len(len).map_mut(&file) })
            .map_err(|e| {
                let _ = std::fs::remove_file(&path);
                BusError::AllocationError {
                    path: path.clone(),
                    source: e,
                }
            })?;

        let bus = Self::from_mmap(name, path, BusRole::Owner, capacity, mmap);
        bus.initialize_header(capacity, len);

        info!(
            "Created event bus {} ({} events, {} bytes)",
            bus.path.display(),
            capacity,
            len
        );
        Ok(bus)
    }

    /// Create a segment, unlinking a stale one of the same name first.
    ///
    /// Used by an owner restarting after a crash. Any process still attached
    /// to the old segment keeps its old mapping and sees no new events.
    pub fn create_or_replace_in(dir: &Path, name: &str, capacity: u32) -> Result<Self, BusError> {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => warn!("Removed stale event bus {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BusError::Io { path, source: e }),
        }
        Self::create_in(dir, name, capacity)
    }

    /// Attach to an existing segment under `/dev/shm`.
    pub fn attach(name: &str) -> Result<Self, BusError> {
        Self::attach_in(Path::new(DEFAULT_SHM_DIR), name)
    }

    /// Attach to an existing segment in `dir` and verify its header.
    pub fn attach_in(dir: &Path, name: &str) -> Result<Self, BusError> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BusError::NotFound(path.clone()),
                _ => BusError::Io {
                    path: path.clone(),
                    source: e,
                },
            })?;

        let file_len = file
            .metadata()
            .map_err(|e| BusError::Io {
                path: path.clone(),
                source: e,
            })?
            .len() as usize;
        if file_len < layout::CONTROL_SIZE {
            return Err(BusError::Corrupt(format!(
                "segment is {} bytes, smaller than the {} byte control block",
                file_len,
                layout::CONTROL_SIZE
            )));
        }

        let mmap = unsafe { MmapOptions::new().len(file_len).map_mut(&file) }.map_err(|e| {
            BusError::Io {
                path: path.clone(),
                source: e,
            }
        })?;

        // Capacity is filled in once the header checks out.
        let mut bus = Self::from_mmap(name, path, BusRole::Attached, 0, mmap);
        bus.capacity = bus.verify_header()?;

        info!(
            "Attached to event bus {} ({} events)",
            bus.path.display(),
            bus.capacity
        );
        Ok(bus)
    }

    fn from_mmap(name: &str, path: PathBuf, role: BusRole, capacity: u32, mut mmap: MmapMut) -> Self {
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name: name.to_string(),
            path,
            role,
            capacity,
            base,
            len,
            counters: LocalCounters::default(),
            mmap,
        }
    }

    fn initialize_header(&self, capacity: u32, len: usize) {
        self.u64_at(layout::OFF_VERSION).store(VERSION, Ordering::Relaxed);
        self.u32_at(layout::OFF_WRITE).store(0, Ordering::Relaxed);
        self.u32_at(layout::OFF_EVENT_SIZE)
            .store(EVENT_SIZE as u32, Ordering::Relaxed);
        self.u32_at(layout::OFF_CAPACITY).store(capacity, Ordering::Relaxed);
        self.u32_at(layout::OFF_SEGMENT_SIZE)
            .store(len as u32, Ordering::Relaxed);
        self.u32_at(layout::OFF_SEQUENCE).store(0, Ordering::Relaxed);
        self.u32_at(layout::OFF_ACTIVE_READERS).store(0, Ordering::Relaxed);
        for slot in 0..MAX_READERS {
            self.u64_at(layout::reader_offset(slot)).store(0, Ordering::Relaxed);
        }
        ContextBlock::new(self).publish(&MusicalContext::default());
        // Magic last: an attacher that sees it sees a complete header.
        self.u64_at(layout::OFF_MAGIC).store(MAGIC, Ordering::Release);
    }

    fn verify_header(&self) -> Result<u32, BusError> {
        let magic = self.u64_at(layout::OFF_MAGIC).load(Ordering::Acquire);
        let version = self.u64_at(layout::OFF_VERSION).load(Ordering::Relaxed);
        if magic != MAGIC || version != VERSION {
            return Err(BusError::VersionMismatch { magic, version });
        }

        let event_size = self.u32_at(layout::OFF_EVENT_SIZE).load(Ordering::Relaxed);
        if event_size as usize != EVENT_SIZE {
            return Err(BusError::Corrupt(format!(
                "event size {} (expected {})",
                event_size, EVENT_SIZE
            )));
        }

        let capacity = self.u32_at(layout::OFF_CAPACITY).load(Ordering::Relaxed);
        if !(2..=MAX_EVENTS).contains(&capacity) {
            return Err(BusError::Corrupt(format!("capacity {}", capacity)));
        }

        let segment_size = self.u32_at(layout::OFF_SEGMENT_SIZE).load(Ordering::Relaxed) as usize;
        let needed = layout::segment_len(capacity);
        if segment_size < needed || segment_size > self.len {
            return Err(BusError::Corrupt(format!(
                "segment size {} for {} events in a {} byte mapping",
                segment_size, capacity, self.len
            )));
        }

        Ok(capacity)
    }

    // Atomic views into the mapping. Offsets are compile-time constants or
    // derived from a checked slot index, always in bounds and naturally aligned
    // (the mapping itself is page aligned).
    pub(crate) fn u32_at(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: in bounds, 4-byte aligned, and only ever accessed atomically.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    pub(crate) fn u64_at(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.len);
        // SAFETY: in bounds, 8-byte aligned, and only ever accessed atomically.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn write_cursor(&self) -> &AtomicU32 {
        self.u32_at(layout::OFF_WRITE)
    }

    fn reader_cursor(&self, slot: usize) -> Result<&AtomicU64, BusError> {
        if slot >= MAX_READERS {
            return Err(BusError::InvalidReader {
                slot,
                max: MAX_READERS,
            });
        }
        Ok(self.u64_at(layout::reader_offset(slot)))
    }

    /// Lowest read position over every slot, as a 32-bit cursor.
    ///
    /// Registration never exempts a slot: readers that do not know about the
    /// mask still hold back the writer until they read or are reset.
    fn min_read_position(&self, write: u32) -> u32 {
        let mut furthest_behind = 0u32;
        let mut min_pos = write;
        for slot in 0..MAX_READERS {
            let pos = self.u64_at(layout::reader_offset(slot)).load(Ordering::Acquire) as u32;
            let behind = write.wrapping_sub(pos);
            if behind > furthest_behind {
                furthest_behind = behind;
                min_pos = pos;
            }
        }
        min_pos
    }

    /// Append one event. Never blocks and never overwrites unread records.
    pub fn write(&self, event: &Event) -> Result<(), BusFull> {
        let start = Instant::now();

        let write = self.write_cursor().load(Ordering::Relaxed);
        let min_read = self.min_read_position(write);
        if write.wrapping_sub(min_read) >= self.capacity - 1 {
            self.counters.drops.fetch_add(1, Ordering::Relaxed);
            debug!("Event bus {} full, dropping {}", self.name, event.event_type);
            return Err(BusFull);
        }

        let offset = layout::slot_offset(write % self.capacity);
        let record = event.encode();
        for (i, word) in record.chunks_exact(8).enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(word);
            // Native-endian keeps the bytes in memory exactly as encoded.
            self.u64_at(offset + i * 8)
                .store(u64::from_ne_bytes(bytes), Ordering::Relaxed);
        }

        self.write_cursor()
            .store(write.wrapping_add(1), Ordering::Release);
        self.u32_at(layout::OFF_SEQUENCE)
            .fetch_add(1, Ordering::Relaxed);

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let latency = start.elapsed().as_nanos() as u64;
        self.counters
            .max_latency_ns
            .fetch_max(latency, Ordering::Relaxed);

        Ok(())
    }

    /// Read up to `max_events` for `slot`, advancing only that slot's cursor.
    pub fn read(&self, slot: usize, max_events: usize) -> Result<Vec<Event>, BusError> {
        let mut events = Vec::with_capacity(max_events.min(self.pending(slot)? as usize));
        self.read_into(slot, max_events, &mut events)?;
        Ok(events)
    }

    /// Like `read`, appending into a caller-owned buffer. Returns the number of
    /// records consumed, including any skipped as undecodable.
    pub fn read_into(&self, slot: usize, max_events: usize, out: &mut Vec<Event>) -> Result<usize, BusError> {
        let cursor = self.reader_cursor(slot)?;
        let read = cursor.load(Ordering::Relaxed);
        let write = self.write_cursor().load(Ordering::Acquire);

        let available = write.wrapping_sub(read as u32) as usize;
        let count = available.min(max_events);

        for i in 0..count {
            let index = (read as u32).wrapping_add(i as u32) % self.capacity;
            let record = self.load_record(index);
            match Event::decode(&record) {
                Ok(event) => out.push(event),
                Err(e) => {
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping record {} on {}: {}", index, self.name, e);
                }
            }
        }

        if count > 0 {
            cursor.store(read + count as u64, Ordering::Release);
            self.counters
                .reads
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(count)
    }

    fn load_record(&self, index: u32) -> [u8; EVENT_SIZE] {
        let offset = layout::slot_offset(index);
        let mut record = [0u8; EVENT_SIZE];
        for (i, chunk) in record.chunks_exact_mut(8).enumerate() {
            let word = self.u64_at(offset + i * 8).load(Ordering::Relaxed);
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        record
    }

    /// Records waiting for `slot`.
    pub fn pending(&self, slot: usize) -> Result<u32, BusError> {
        let read = self.reader_cursor(slot)?.load(Ordering::Acquire);
        let write = self.write_cursor().load(Ordering::Acquire);
        Ok(write.wrapping_sub(read as u32))
    }

    /// Current read position of `slot`.
    pub fn read_position(&self, slot: usize) -> Result<u64, BusError> {
        Ok(self.reader_cursor(slot)?.load(Ordering::Acquire))
    }

    /// Current write cursor.
    pub fn write_position(&self) -> u32 {
        self.write_cursor().load(Ordering::Acquire)
    }

    /// Skip everything pending for `slot`. Returns how many records were discarded.
    pub fn reset_reader(&self, slot: usize) -> Result<u32, BusError> {
        let cursor = self.reader_cursor(slot)?;
        let read = cursor.load(Ordering::Relaxed);
        let write = self.write_cursor().load(Ordering::Acquire);
        let skipped = write.wrapping_sub(read as u32);
        cursor.store(read + skipped as u64, Ordering::Release);
        if skipped > 0 {
            warn!("Reader {} on {} reset, skipped {} events", slot, self.name, skipped);
        }
        Ok(skipped)
    }

    /// Mark `slot` as in use and start it at the current write cursor.
    pub fn register_reader(&self, slot: usize) -> Result<(), BusError> {
        self.reset_reader(slot)?;
        self.u32_at(layout::OFF_ACTIVE_READERS)
            .fetch_or(1 << slot, Ordering::AcqRel);
        debug!("Reader {} registered on {}", slot, self.name);
        Ok(())
    }

    /// Clear a slot's registration bit. Its cursor still counts toward the
    /// full check; `reset_reader` is what lets an idle slot stop holding back
    /// the writer.
    pub fn release_reader(&self, slot: usize) -> Result<(), BusError> {
        self.reader_cursor(slot)?;
        self.u32_at(layout::OFF_ACTIVE_READERS)
            .fetch_and(!(1 << slot), Ordering::AcqRel);
        debug!("Reader {} released on {}", slot, self.name);
        Ok(())
    }

    /// Bitmask of registered reader slots.
    pub fn active_readers(&self) -> u32 {
        self.u32_at(layout::OFF_ACTIVE_READERS).load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BusStats {
        let write = self.write_position();
        let min_read = self.min_read_position(write);
        let pending = write.wrapping_sub(min_read);
        BusStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            drops: self.counters.drops.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            max_latency_ns: self.counters.max_latency_ns.load(Ordering::Relaxed),
            write_position: write,
            min_read_position: min_read,
            events_pending: pending,
            buffer_usage: pending as f64 / self.capacity as f64,
            sequence: self.u32_at(layout::OFF_SEQUENCE).load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }

    /// Publish a musical context snapshot. Owner only, by convention.
    pub fn publish_context(&self, context: &MusicalContext) {
        ContextBlock::new(self).publish(context);
    }

    /// Read the latest musical context snapshot.
    pub fn context(&self) -> MusicalContext {
        ContextBlock::new(self).snapshot()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> BusRole {
        self.role
    }

    pub fn is_owner(&self) -> bool {
        self.role == BusRole::Owner
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Sync the mapping to its backing file.
    pub fn flush(&self) -> Result<(), BusError> {
        self.mmap.flush().map_err(|e| BusError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Unmap without touching the segment.
    pub fn detach(self) {
        debug!("Detached from event bus {}", self.path.display());
    }

    /// Unmap and unlink the segment.
    ///
    /// Only the owner may destroy. A non-owner handle is detached and gets
    /// `NotOwner`. Readers still attached keep their mapping until they detach.
    pub fn destroy(self) -> Result<(), BusError> {
        if !self.is_owner() {
            return Err(BusError::NotOwner);
        }
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path).map_err(|e| BusError::Io {
            path: path.clone(),
            source: e,
        })?;
        info!("Destroyed event bus {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventFlags, EventType};
    use tempfile::TempDir;

    fn note(pitch: f32) -> Event {
        Event::now(1, EventType::NoteOn)
            .with_pitch(pitch)
            .with_velocity(0.8)
            .with_flags(EventFlags::NEEDS_SYNTH)
    }

    #[test]
    fn test_create_writes_header() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "hdr", 64).unwrap();

        assert_eq!(bus.u64_at(layout::OFF_MAGIC).load(Ordering::Relaxed), MAGIC);
        assert_eq!(bus.u64_at(layout::OFF_VERSION).load(Ordering::Relaxed), VERSION);
        assert_eq!(bus.u32_at(layout::OFF_EVENT_SIZE).load(Ordering::Relaxed), 32);
        assert_eq!(bus.u32_at(layout::OFF_CAPACITY).load(Ordering::Relaxed), 64);
        assert_eq!(
            bus.u32_at(layout::OFF_SEGMENT_SIZE).load(Ordering::Relaxed) as usize,
            layout::segment_len(64)
        );
        assert_eq!(bus.write_position(), 0);
        assert!(bus.is_owner());
    }

    #[test]
    fn test_create_twice_is_already_exists() {
        let dir = TempDir::new().unwrap();
        let _bus = EventBus::create_in(dir.path(), "dup", 16).unwrap();
        let err = EventBus::create_in(dir.path(), "dup", 16).unwrap_err();
        assert!(matches!(err, BusError::AlreadyExists(_)));
    }

    #[test]
    fn test_create_rejects_bad_capacity() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            EventBus::create_in(dir.path(), "tiny", 1),
            Err(BusError::InvalidCapacity(1))
        ));
        assert!(matches!(
            EventBus::create_in(dir.path(), "huge", MAX_EVENTS + 1),
            Err(BusError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_write_read_in_order() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "order", 16).unwrap();

        for i in 0..5 {
            bus.write(&note(60.0 + i as f32)).unwrap();
        }

        let events = bus.read(0, 100).unwrap();
        let pitches: Vec<f32> = events.iter().map(|e| e.pitch).collect();
        assert_eq!(pitches, vec![60.0, 61.0, 62.0, 63.0, 64.0]);
        assert_eq!(bus.pending(0).unwrap(), 0);
        assert_eq!(bus.read_position(0).unwrap(), 5);
    }

    #[test]
    fn test_read_respects_max_events() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "batch", 16).unwrap();
        for i in 0..6 {
            bus.write(&note(i as f32)).unwrap();
        }

        assert_eq!(bus.read(0, 4).unwrap().len(), 4);
        assert_eq!(bus.pending(0).unwrap(), 2);
        assert_eq!(bus.read(0, 4).unwrap().len(), 2);
        assert!(bus.read(0, 4).unwrap().is_empty());
    }

    #[test]
    fn test_full_without_registration_counts_every_slot() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "full", 8).unwrap();

        // capacity - 1 writes fill the ring; the next is rejected
        for i in 0..7 {
            bus.write(&note(i as f32)).unwrap();
        }
        assert_eq!(bus.write(&note(99.0)), Err(BusFull));

        // Reader 0 catching up is not enough while slots 1..5 sit at zero
        bus.read(0, 100).unwrap();
        assert_eq!(bus.write(&note(99.0)), Err(BusFull));

        let stats = bus.stats();
        assert_eq!(stats.writes, 7);
        assert_eq!(stats.drops, 2);
        assert_eq!(stats.events_pending, 7);
    }

    #[test]
    fn test_full_leaves_slot_untouched() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "untouched", 4).unwrap();
        bus.register_reader(0).unwrap();

        for i in 0..3 {
            bus.write(&note(i as f32)).unwrap();
        }
        let before = bus.load_record(3);
        assert_eq!(bus.write(&note(42.0)), Err(BusFull));
        assert_eq!(bus.load_record(3), before);
        assert_eq!(bus.write_position(), 3);
    }

    #[test]
    fn test_registered_reader_still_waits_for_idle_slots() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "registered", 8).unwrap();
        bus.register_reader(2).unwrap();
        assert_eq!(bus.active_readers(), 0b100);

        for i in 0..7 {
            bus.write(&note(i as f32)).unwrap();
        }
        assert_eq!(bus.read(2, 100).unwrap().len(), 7);
        // Slots 0, 1, 3 and 4 have not read anything yet
        assert_eq!(bus.write(&note(0.0)), Err(BusFull));

        for slot in [0, 1, 3, 4] {
            bus.reset_reader(slot).unwrap();
        }
        for round in 1..4 {
            for i in 0..7 {
                bus.write(&note((round * 10 + i) as f32)).unwrap();
            }
            assert!(bus.write(&note(0.0)).is_err());
            let events = bus.read(2, 100).unwrap();
            assert_eq!(events.len(), 7);
            assert_eq!(events[0].pitch, (round * 10) as f32);
            for slot in [0, 1, 3, 4] {
                bus.reset_reader(slot).unwrap();
            }
        }

        bus.release_reader(2).unwrap();
        assert_eq!(bus.active_readers(), 0);
    }

    #[test]
    fn test_reset_reader_skips_backlog() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "reset", 16).unwrap();
        for i in 0..5 {
            bus.write(&note(i as f32)).unwrap();
        }

        assert_eq!(bus.reset_reader(1).unwrap(), 5);
        assert_eq!(bus.pending(1).unwrap(), 0);
        // Other readers keep their backlog
        assert_eq!(bus.pending(0).unwrap(), 5);

        bus.write(&note(77.0)).unwrap();
        let events = bus.read(1, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pitch, 77.0);
    }

    #[test]
    fn test_invalid_reader_slot() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "slots", 16).unwrap();
        assert!(matches!(
            bus.read(MAX_READERS, 1),
            Err(BusError::InvalidReader { slot: 5, max: 5 })
        ));
        assert!(bus.reset_reader(9).is_err());
        assert!(bus.register_reader(5).is_err());
    }

    #[test]
    fn test_stats_usage_fraction() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "usage", 10).unwrap();
        for i in 0..5 {
            bus.write(&note(i as f32)).unwrap();
        }
        let stats = bus.stats();
        assert_eq!(stats.write_position, 5);
        assert_eq!(stats.sequence, 5);
        assert!((stats.buffer_usage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_destroy_unlinks() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::create_in(dir.path(), "gone", 16).unwrap();
        let path = bus.path().to_path_buf();
        assert!(path.exists());
        bus.destroy().unwrap();
        assert!(!path.exists());
    }
}
