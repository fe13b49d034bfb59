#![forbid(unsafe_code)]
//! Crash recovery and space-accounting rebuild for loess.
//!
//! After an unclean shutdown, the number of references each physical
//! block really has — and the logical-to-physical map itself — may
//! disagree with what reached the device. This crate reconstructs a
//! consistent state from the recovery journal:
//!
//! - **Targeted replay** (a trustworthy journal): sort the journal's
//!   entries and apply them to the block map's leaf pages, then feed
//!   the tail segment into each slab's journal, from which the slab's
//!   reference counters are re-derived and persisted.
//! - **Read-only rebuild** (an untrustworthy journal or map): ignore
//!   the journal's reference deltas entirely and recount everything
//!   the map says is mapped, walking interior tree pages and then
//!   every leaf page.
//!
//! Both paths converge on flushing the block map, draining every
//! slab, and reporting the recovered usage figures for the caller to
//! persist. The entry point is [`repair`].

mod block_map_replay;
mod coordinator;
mod heap;

pub use block_map_replay::{NumberedBlockMapping, replay_into_block_map};
pub use coordinator::{
    LoadState, RecoveryContext, RecoveryCoordinator, RecoveryMode, RecoverySummary, repair,
};
pub use heap::SortHeap;
