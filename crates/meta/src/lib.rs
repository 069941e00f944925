//! Master metadata persistence and recovery: a sectioned, versioned
//! on-disk image with per-section checksums, an append-only changelog,
//! crash-consistent snapshotting, and automatic restore that picks the
//! newest consistent image plus the replayable changelog range.

pub mod changelog;
pub mod image;
pub mod restore;
pub mod saver;
pub mod sections;
pub mod state;
mod wire;

pub use changelog::{Changelog, MAX_ID_HOLE, ReplayError};
pub use image::{FileCheck, LoadError, check_file, load_from_file, store_to_file};
pub use restore::{RestoreOptions, load_all, restore_to_disk};
pub use saver::{MetaEngine, SaveSettings, StoreOutcome, emergency_store};
pub use state::{ApplyError, MetaState, SectionId};
