//! Replicated data layer for the incident log.
//!
//! Three pieces compose into the full replicated collection:
//!
//! - [`envelope`] — a per-field last-writer-wins envelope over any
//!   [`Record`](matchlog_primitives::Record) type;
//! - [`growset`] — a monotonic set used for deletion tombstones;
//! - [`map`] — a keyed collection of envelopes paired with a tombstone set,
//!   whose three-way merge also reports what each side still has to learn.
//!
//! All merges are commutative, associative, and idempotent on resolved
//! state, and survive arbitrary interleavings of offline edits, deletions,
//! and reconnections.

#![deny(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::panic, clippy::unwrap_used))]

pub mod envelope;
pub mod error;
pub mod growset;
pub mod map;

pub use envelope::{merge_lww, Envelope, FieldEdit, FieldMeta, LwwMerge};
pub use error::CrdtError;
pub use growset::{GrowSet, GrowSetMerge};
pub use map::{merge_map, ConsistentMap, MapMerge, SyncSlice};

#[cfg(test)]
mod tests;
