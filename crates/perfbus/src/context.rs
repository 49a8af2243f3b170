//! Shared musical context - a few scalars every process wants to read.
//!
//! Lives in the otherwise unused tail of the control block. One owner
//! publishes whole snapshots; readers take a consistent copy using a
//! sequence counter (odd while a publish is in progress).
//!
//! ```text
//! offset  field
//!    128  generation  u32
//!    132  tempo       f32 bpm
//!    136  beat        f32
//!    140  bar         u32
//!    144  key         u32 pitch class
//!    148  mode        u32 0 = major, 1 = minor
//!    152  dynamics    f32 0..1
//!    156  harmony     13 x f32 (12 pitch classes + root)
//! ```

use crate::bus::EventBus;
use crate::layout::OFF_CONTEXT;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicU32, Ordering};

pub const HARMONY_LEN: usize = 13;
pub(crate) const CONTEXT_SIZE: usize = 28 + HARMONY_LEN * 4;

const OFF_GENERATION: usize = OFF_CONTEXT;
const OFF_TEMPO: usize = OFF_CONTEXT + 4;
const OFF_BEAT: usize = OFF_CONTEXT + 8;
const OFF_BAR: usize = OFF_CONTEXT + 12;
const OFF_KEY: usize = OFF_CONTEXT + 16;
const OFF_MODE: usize = OFF_CONTEXT + 20;
const OFF_DYNAMICS: usize = OFF_CONTEXT + 24;
const OFF_HARMONY: usize = OFF_CONTEXT + 28;

/// Reader gives up waiting for a quiet generation after this many tries.
const MAX_SNAPSHOT_ATTEMPTS: usize = 64;

/// Global tempo/harmony snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalContext {
    pub tempo: f32,
    pub beat: f32,
    pub bar: u32,
    pub key: u32,
    pub mode: u32,
    pub dynamics: f32,
    pub harmony: [f32; HARMONY_LEN],
}

impl Default for MusicalContext {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            beat: 0.0,
            bar: 0,
            key: 0,
            mode: 0,
            dynamics: 0.7,
            harmony: [0.0; HARMONY_LEN],
        }
    }
}

pub(crate) struct ContextBlock<'a> {
    bus: &'a EventBus,
}

impl<'a> ContextBlock<'a> {
    pub(crate) fn new(bus: &'a EventBus) -> Self {
        Self { bus }
    }

    fn cell(&self, offset: usize) -> &AtomicU32 {
        self.bus.u32_at(offset)
    }

    pub(crate) fn publish(&self, ctx: &MusicalContext) {
        let generation = self.cell(OFF_GENERATION);
        let start = generation.load(Ordering::Relaxed);
        // Odd while the fields are in flux
        generation.store(start.wrapping_add(1) | 1, Ordering::Relaxed);
        fence(Ordering::Release);

        self.cell(OFF_TEMPO).store(ctx.tempo.to_bits(), Ordering::Relaxed);
        self.cell(OFF_BEAT).store(ctx.beat.to_bits(), Ordering::Relaxed);
        self.cell(OFF_BAR).store(ctx.bar, Ordering::Relaxed);
        self.cell(OFF_KEY).store(ctx.key, Ordering::Relaxed);
        self.cell(OFF_MODE).store(ctx.mode, Ordering::Relaxed);
        self.cell(OFF_DYNAMICS).store(ctx.dynamics.to_bits(), Ordering::Relaxed);
        for (i, value) in ctx.harmony.iter().enumerate() {
            self.cell(OFF_HARMONY + i * 4)
                .store(value.to_bits(), Ordering::Relaxed);
        }

        generation.store((start | 1).wrapping_add(1), Ordering::Release);
    }

    fn read_fields(&self) -> MusicalContext {
        let mut harmony = [0.0; HARMONY_LEN];
        for (i, slot) in harmony.iter_mut().enumerate() {
            *slot = f32::from_bits(self.cell(OFF_HARMONY + i * 4).load(Ordering::Relaxed));
        }
        MusicalContext {
            tempo: f32::from_bits(self.cell(OFF_TEMPO).load(Ordering::Relaxed)),
            beat: f32::from_bits(self.cell(OFF_BEAT).load(Ordering::Relaxed)),
            bar: self.cell(OFF_BAR).load(Ordering::Relaxed),
            key: self.cell(OFF_KEY).load(Ordering::Relaxed),
            mode: self.cell(OFF_MODE).load(Ordering::Relaxed),
            dynamics: f32::from_bits(self.cell(OFF_DYNAMICS).load(Ordering::Relaxed)),
            harmony,
        }
    }

    /// Consistent copy, or the last attempt if the writer never goes quiet.
    pub(crate) fn snapshot(&self) -> MusicalContext {
        let generation = self.cell(OFF_GENERATION);
        let mut last = self.read_fields();
        for _ in 0..MAX_SNAPSHOT_ATTEMPTS {
            let before = generation.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            last = self.read_fields();
            fence(Ordering::Acquire);
            if generation.load(Ordering::Relaxed) == before {
                return last;
            }
        }
        last
    }
}
