//! perfbus - cross-process musical event bus for Performia.
//!
//! A fixed 1 MiB shared-memory segment carries a ring of 32-byte event
//! records from one writer (the listener) to up to five independent readers
//! (synth bridge, UI, monitors). Writes take microseconds and never block;
//! a full ring rejects the event and counts the drop.
//!
//! ## Layout
//!
//! The segment layout is byte-compatible with the other language bindings
//! that attach to the same name. See [`layout`] and [`event`] for offsets.
//!
//! ## Pieces
//!
//! - [`EventBus`] - create/attach, write, per-slot read, stats, teardown
//! - [`Event`], [`EventType`], [`EventFlags`] - the wire record
//! - [`MusicalContext`] - tempo/key/harmony snapshot stored in the control block
//! - [`BusPoller`] - tokio task draining one reader slot into a channel
//!
//! ```rust,no_run
//! use perfbus::{Event, EventBus, EventType, MAX_EVENTS};
//!
//! let bus = EventBus::create("PerformiaBuffer", MAX_EVENTS)?;
//! bus.write(&Event::now(0, EventType::NoteOn).with_pitch(60.0).with_velocity(0.8))?;
//!
//! let reader = EventBus::attach("PerformiaBuffer")?;
//! for event in reader.read(0, 100)? {
//!     println!("{event}");
//! }
//! bus.destroy()?;
//! # Ok::<(), perfbus::BusError>(())
//! ```

pub mod bus;
pub mod context;
pub mod error;
pub mod event;
pub mod layout;
pub mod poller;

pub use bus::{BusRole, BusStats, EventBus, DEFAULT_SHM_DIR};
pub use context::{MusicalContext, HARMONY_LEN};
pub use error::{BusError, BusFull};
pub use event::{now_ns, Event, EventError, EventFlags, EventType, EVENT_SIZE};
pub use layout::{BUFFER_SIZE, CONTROL_SIZE, MAGIC, MAX_EVENTS, MAX_READERS, VERSION};
pub use poller::{BusPoller, PollerConfig, PollerHandle, PollerSummary};
