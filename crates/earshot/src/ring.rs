//! Lock-free sample ring between the audio callback and the analysis thread.
//!
//! ```text
//! audio callback (RT)            analysis thread
//!       │                              │
//!       ▼                              ▼
//! RingProducer::write() ──────▶ RingConsumer::read() / window()
//! (wait-free, never blocks)     (never blocks)
//! ```
//!
//! Cursors are monotonic frame counts. The producer keeps `history` frames
//! behind the read cursor untouched so the consumer can take overlapping
//! analysis windows without racing new writes.

use crate::frame::AudioFrame;
use portable_atomic::AtomicF32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring capacity {capacity} frames cannot hold {history} frames of history plus a block")]
    TooSmall { capacity: usize, history: usize },

    #[error("channel count must be at least 1")]
    NoChannels,
}

struct Shared {
    data: Box<[AtomicF32]>,
    capacity: usize,
    channels: usize,
    history: usize,
    write: AtomicU64,
    read: AtomicU64,
    drops: AtomicU64,
}

impl Shared {
    #[inline]
    fn slot(&self, position: u64, channel: usize) -> &AtomicF32 {
        let frame = (position % self.capacity as u64) as usize;
        &self.data[frame * self.channels + channel]
    }

    fn free_between(&self, write: u64, read: u64) -> usize {
        let retained_from = read.saturating_sub(self.history as u64);
        let used = write.wrapping_sub(retained_from) as usize;
        (self.capacity - 1).saturating_sub(used)
    }
}

/// Create a ring of `capacity` frames with `channels` interleaved channels.
///
/// `history` frames behind the read cursor stay readable through
/// [`RingConsumer::window`].
pub fn sample_ring(
    capacity: usize,
    channels: usize,
    history: usize,
) -> Result<(RingProducer, RingConsumer), RingError> {
    if channels == 0 {
        return Err(RingError::NoChannels);
    }
    if capacity <= history + 1 {
        return Err(RingError::TooSmall { capacity, history });
    }

    let data = (0..capacity * channels)
        .map(|_| AtomicF32::new(0.0))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        data,
        capacity,
        channels,
        history,
        write: AtomicU64::new(0),
        read: AtomicU64::new(0),
        drops: AtomicU64::new(0),
    });

    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    ))
}

/// Write side, owned by the audio callback.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Append interleaved samples. Returns false and counts a drop when the
    /// whole block does not fit; nothing is written in that case.
    pub fn write(&mut self, samples: &[f32]) -> bool {
        let s = &*self.shared;
        if samples.len() % s.channels != 0 {
            s.drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let frames = samples.len() / s.channels;

        let write = s.write.load(Ordering::Relaxed);
        let read = s.read.load(Ordering::Acquire);
        if s.free_between(write, read) < frames {
            s.drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        for (i, frame) in samples.chunks_exact(s.channels).enumerate() {
            let position = write + i as u64;
            for (c, &sample) in frame.iter().enumerate() {
                s.slot(position, c).store(sample, Ordering::Relaxed);
            }
        }

        s.write.store(write + frames as u64, Ordering::Release);
        true
    }

    /// Frames that can be written right now.
    pub fn free(&self) -> usize {
        let s = &*self.shared;
        s.free_between(s.write.load(Ordering::Relaxed), s.read.load(Ordering::Acquire))
    }

    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    pub fn drops(&self) -> u64 {
        self.shared.drops.load(Ordering::Relaxed)
    }
}

/// Read side, owned by the analysis thread.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Exactly `frames` frames, or `None` if fewer are available.
    pub fn read(&mut self, frames: usize) -> Option<AudioFrame> {
        let mut out = Vec::with_capacity(frames * self.shared.channels);
        if self.read_into(frames, &mut out) {
            Some(AudioFrame::new(self.shared.channels, out))
        } else {
            None
        }
    }

    /// Like [`read`](Self::read) but fills a caller buffer. Returns false on underrun.
    pub fn read_into(&mut self, frames: usize, out: &mut Vec<f32>) -> bool {
        let s = &*self.shared;
        let read = s.read.load(Ordering::Relaxed);
        let write = s.write.load(Ordering::Acquire);
        if write.wrapping_sub(read) < frames as u64 {
            return false;
        }

        out.clear();
        self.copy_range(read, frames, out);
        s.read.store(read + frames as u64, Ordering::Release);
        true
    }

    /// Non-destructive read starting `offset` frames past the read cursor.
    pub fn peek(&self, frames: usize, offset: usize) -> Option<AudioFrame> {
        let s = &*self.shared;
        let read = s.read.load(Ordering::Relaxed);
        let write = s.write.load(Ordering::Acquire);
        if write.wrapping_sub(read) < (frames + offset) as u64 {
            return None;
        }

        let mut out = Vec::with_capacity(frames * s.channels);
        self.copy_range(read + offset as u64, frames, &mut out);
        Some(AudioFrame::new(s.channels, out))
    }

    /// The most recent `frames` frames, independent of the read cursor.
    ///
    /// Frames older than the retained history (or never written) come back
    /// as zeros at the front of the window.
    pub fn window(&self, frames: usize) -> AudioFrame {
        let mut out = Vec::with_capacity(frames * self.shared.channels);
        self.window_into(frames, &mut out);
        AudioFrame::new(self.shared.channels, out)
    }

    /// Mono downmix of [`window`](Self::window) into a reusable buffer.
    pub fn window_mono_into(&self, frames: usize, out: &mut Vec<f32>) {
        let (start, end) = self.window_bounds(frames);
        self.mono_range_into(start, end, frames, out);
    }

    /// Mono downmix of the `frames` frames ending at the read cursor, i.e.
    /// the block just read plus the history before it.
    pub fn trailing_mono_into(&self, frames: usize, out: &mut Vec<f32>) {
        let s = &*self.shared;
        let end = s.read.load(Ordering::Relaxed);
        let oldest = end.saturating_sub(s.history as u64);
        let start = end.saturating_sub(frames as u64).max(oldest);
        self.mono_range_into(start, end, frames, out);
    }

    fn mono_range_into(&self, start: u64, end: u64, frames: usize, out: &mut Vec<f32>) {
        let s = &*self.shared;
        let pad = frames - (end - start) as usize;

        out.clear();
        out.resize(pad, 0.0);
        let scale = 1.0 / s.channels as f32;
        for position in start..end {
            let sum: f32 = (0..s.channels)
                .map(|c| s.slot(position, c).load(Ordering::Relaxed))
                .sum();
            out.push(sum * scale);
        }
    }

    fn window_into(&self, frames: usize, out: &mut Vec<f32>) {
        let s = &*self.shared;
        let (start, end) = self.window_bounds(frames);
        let pad = frames - (end - start) as usize;

        out.clear();
        out.resize(pad * s.channels, 0.0);
        self.copy_range(start, (end - start) as usize, out);
    }

    // Frames in [start, end) are never rewritten while the read cursor stays put.
    fn window_bounds(&self, frames: usize) -> (u64, u64) {
        let s = &*self.shared;
        let read = s.read.load(Ordering::Relaxed);
        let end = s.write.load(Ordering::Acquire);
        let oldest = read.saturating_sub(s.history as u64);
        let start = end.saturating_sub(frames as u64).max(oldest);
        (start, end)
    }

    fn copy_range(&self, start: u64, frames: usize, out: &mut Vec<f32>) {
        let s = &*self.shared;
        for i in 0..frames as u64 {
            for c in 0..s.channels {
                out.push(s.slot(start + i, c).load(Ordering::Relaxed));
            }
        }
    }

    /// Frames ready to read.
    pub fn available(&self) -> usize {
        let s = &*self.shared;
        s.write
            .load(Ordering::Acquire)
            .wrapping_sub(s.read.load(Ordering::Relaxed)) as usize
    }

    /// Frames the producer could write right now.
    pub fn free(&self) -> usize {
        let s = &*self.shared;
        s.free_between(s.write.load(Ordering::Acquire), s.read.load(Ordering::Relaxed))
    }

    /// Discard unread frames.
    pub fn clear(&mut self) {
        let s = &*self.shared;
        let write = s.write.load(Ordering::Acquire);
        s.read.store(write, Ordering::Release);
    }

    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn drops(&self) -> u64 {
        self.shared.drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ring_buffer_write_read() {
        let (mut tx, mut rx) = sample_ring(16, 1, 0).unwrap();

        assert!(tx.write(&[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(rx.available(), 4);

        let frame = rx.read(4).unwrap();
        assert_eq!(frame.samples(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(rx.available(), 0);
        assert!(rx.read(1).is_none());
    }

    #[test]
    fn test_ring_buffer_wraparound() {
        let (mut tx, mut rx) = sample_ring(8, 1, 0).unwrap();

        assert!(tx.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        rx.read(4).unwrap();
        assert!(tx.write(&[7.0, 8.0, 9.0, 10.0]));

        let all = rx.read(6).unwrap();
        assert_eq!(all.samples(), &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn test_full_write_rejected_and_counted() {
        let (mut tx, rx) = sample_ring(8, 2, 0).unwrap();
        assert_eq!(tx.free(), 7);

        assert!(tx.write(&[0.5; 14]));
        assert_eq!(tx.free(), 0);
        assert!(!tx.write(&[1.0, 1.0]));
        assert_eq!(rx.drops(), 1);
        assert_eq!(rx.available(), 7);
    }

    #[test]
    fn test_partial_frame_rejected() {
        let (mut tx, rx) = sample_ring(8, 2, 0).unwrap();
        assert!(!tx.write(&[1.0, 2.0, 3.0]));
        assert_eq!(rx.available(), 0);
        assert_eq!(tx.drops(), 1);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut tx, mut rx) = sample_ring(16, 1, 0).unwrap();
        tx.write(&[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(rx.peek(2, 1).unwrap().samples(), &[2.0, 3.0]);
        assert!(rx.peek(4, 1).is_none());
        assert_eq!(rx.available(), 4);
        assert_eq!(rx.read(2).unwrap().samples(), &[1.0, 2.0]);
    }

    #[test]
    fn test_window_is_most_recent_and_zero_padded() {
        let (mut tx, mut rx) = sample_ring(32, 1, 8).unwrap();
        tx.write(&[1.0, 2.0, 3.0]);

        assert_eq!(rx.window(5).samples(), &[0.0, 0.0, 1.0, 2.0, 3.0]);

        rx.read(3).unwrap();
        tx.write(&[4.0, 5.0]);
        assert_eq!(rx.window(4).samples(), &[2.0, 3.0, 4.0, 5.0]);
        // Window ignores the read cursor
        assert_eq!(rx.available(), 2);
    }

    #[test]
    fn test_history_is_protected_from_overwrite() {
        let (mut tx, mut rx) = sample_ring(8, 1, 4).unwrap();
        tx.write(&[1.0, 2.0, 3.0]);
        rx.read(3).unwrap();

        // Three read frames are retained as history
        assert_eq!(tx.free(), 4);
        assert!(tx.write(&[4.0, 5.0, 6.0, 7.0]));
        assert!(!tx.write(&[8.0]));

        let mut mono = Vec::new();
        rx.window_mono_into(7, &mut mono);
        assert_eq!(mono, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_window_mono_downmixes() {
        let (mut tx, rx) = sample_ring(16, 2, 4).unwrap();
        tx.write(&[1.0, 0.0, 0.0, 1.0]);

        let mut mono = Vec::new();
        rx.window_mono_into(3, &mut mono);
        assert_eq!(mono, vec![0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_trailing_window_ends_at_read_cursor() {
        let (mut tx, mut rx) = sample_ring(32, 1, 4).unwrap();
        tx.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        rx.read(2).unwrap();
        rx.read(2).unwrap();

        let mut mono = Vec::new();
        rx.trailing_mono_into(3, &mut mono);
        assert_eq!(mono, vec![2.0, 3.0, 4.0]);

        // Longer than the retained history: zero-padded in front
        rx.trailing_mono_into(6, &mut mono);
        assert_eq!(mono, vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_clear_discards_unread() {
        let (mut tx, mut rx) = sample_ring(16, 1, 0).unwrap();
        tx.write(&[1.0; 10]);
        rx.clear();
        assert_eq!(rx.available(), 0);
        assert_eq!(tx.free(), 15);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(matches!(sample_ring(4, 0, 0), Err(RingError::NoChannels)));
        assert!(matches!(
            sample_ring(8, 1, 7),
            Err(RingError::TooSmall { capacity: 8, history: 7 })
        ));
    }

    #[test]
    fn test_ring_buffer_conservation_across_threads() {
        const TOTAL: usize = 50_000;
        const BLOCK: usize = 7;

        let (mut tx, mut rx) = sample_ring(64, 1, 16).unwrap();

        let producer = thread::spawn(move || {
            let mut next = 0usize;
            let mut rejected = 0u64;
            while next < TOTAL {
                let n = BLOCK.min(TOTAL - next);
                let block: Vec<f32> = (next..next + n).map(|v| v as f32).collect();
                if tx.free() >= n {
                    assert!(tx.write(&block));
                    next += n;
                } else if !tx.write(&block) {
                    rejected += 1;
                    thread::yield_now();
                } else {
                    next += n;
                }
            }
            rejected
        });

        let mut expected = 0usize;
        while expected < TOTAL {
            let want = rx.available().min(5);
            if want == 0 {
                thread::yield_now();
                continue;
            }
            let frame = rx.read(want).unwrap();
            for &sample in frame.samples() {
                assert_eq!(sample, expected as f32);
                expected += 1;
            }
        }

        let rejected = producer.join().unwrap();
        assert_eq!(rx.drops(), rejected);
        assert_eq!(rx.available(), 0);
    }
}
