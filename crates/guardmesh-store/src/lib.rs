//! Persistence layer for Guardmesh.
//!
//! Two stores live here, both using the same crash-safe discipline
//! (write a sibling temp file, fsync, atomically rename over the canonical
//! path):
//!
//! - [`PatternStore`] — the append-mostly catalog of known attack
//!   fingerprints, grouped by category, with O(1) duplicate detection.
//! - [`OfflineQueue`] — a durable FIFO of gossip messages that could not be
//!   delivered because no peer was reachable.

pub mod offline_queue;
pub mod pattern_store;

pub use offline_queue::{OfflineQueue, ProcessReport, QueueItem, QueueKind};
pub use pattern_store::{AddOutcome, CategoryEntry, PatternStore, SharedPatternStore};
