use std::path::PathBuf;
use thiserror::Error;

/// Returned by `EventBus::write` when every free slot is still unread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event bus full")]
pub struct BusFull;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus segment already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("failed to allocate bus segment {path}: {source}")]
    AllocationError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bus segment not found: {0}")]
    NotFound(PathBuf),

    #[error("bus header mismatch: magic {magic:#018x}, version {version}")]
    VersionMismatch { magic: u64, version: u64 },

    #[error("bus header corrupt: {0}")]
    Corrupt(String),

    #[error("invalid capacity {0}: must be within 2..={max}", max = crate::layout::MAX_EVENTS)]
    InvalidCapacity(u32),

    #[error("reader slot {slot} out of range (0..{max})")]
    InvalidReader { slot: usize, max: usize },

    #[error(transparent)]
    Full(#[from] BusFull),

    #[error("only the creating process may destroy the bus")]
    NotOwner,

    #[error("bus I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
