//! Byte layout of the shared segment.
//!
//! ```text
//! offset  size  field
//!      0     8  magic            0xDEADBEEF12345678
//!      8     8  version          1
//!     16     4  write cursor     u32, wraps
//!     20     4  (padding)
//!     24     4  event size       32
//!     28     4  capacity         max events
//!     32     4  segment size     bytes
//!     36     4  sequence         u32, one per successful write
//!     40     4  active readers   u32 bitmask, 0 = every slot counts
//!     64  8 x 5 read cursors     u64 each
//!    128    80  musical context  see `context`
//!    256     -  event slots      capacity x 32 bytes
//! ```

use crate::event::EVENT_SIZE;

pub const MAGIC: u64 = 0xDEAD_BEEF_1234_5678;
pub const VERSION: u64 = 1;

/// Total segment size of a full-capacity bus.
pub const BUFFER_SIZE: usize = 1024 * 1024;
pub const CONTROL_SIZE: usize = 256;
/// 32760 events.
pub const MAX_EVENTS: u32 = ((BUFFER_SIZE - CONTROL_SIZE) / EVENT_SIZE) as u32;
/// GUI, synth, and three monitor slots.
pub const MAX_READERS: usize = 5;

pub(crate) const OFF_MAGIC: usize = 0;
pub(crate) const OFF_VERSION: usize = 8;
pub(crate) const OFF_WRITE: usize = 16;
pub(crate) const OFF_EVENT_SIZE: usize = 24;
pub(crate) const OFF_CAPACITY: usize = 28;
pub(crate) const OFF_SEGMENT_SIZE: usize = 32;
pub(crate) const OFF_SEQUENCE: usize = 36;
pub(crate) const OFF_ACTIVE_READERS: usize = 40;
pub(crate) const OFF_READERS: usize = 64;
pub(crate) const OFF_CONTEXT: usize = 128;

/// Segment bytes needed for `capacity` events.
pub const fn segment_len(capacity: u32) -> usize {
    CONTROL_SIZE + capacity as usize * EVENT_SIZE
}

pub(crate) const fn reader_offset(slot: usize) -> usize {
    OFF_READERS + slot * 8
}

pub(crate) const fn slot_offset(index: u32) -> usize {
    CONTROL_SIZE + index as usize * EVENT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity_fills_one_mebibyte() {
        assert_eq!(MAX_EVENTS, 32760);
        assert_eq!(segment_len(MAX_EVENTS), BUFFER_SIZE);
    }

    #[test]
    fn test_regions_do_not_overlap() {
        assert!(OFF_ACTIVE_READERS + 4 <= OFF_READERS);
        assert!(reader_offset(MAX_READERS) <= OFF_CONTEXT);
        assert!(OFF_CONTEXT + crate::context::CONTEXT_SIZE <= CONTROL_SIZE);
    }
}
