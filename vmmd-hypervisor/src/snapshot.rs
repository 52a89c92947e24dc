//! Atomically replaced node snapshots.
//!
//! A poll never edits the snapshot readers hold. It builds a complete new
//! [`NodeSnapshot`] and swaps it in, so a reader sees either the previous
//! poll or the next one and nothing in between.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vmmd_proto::NodeSnapshot;

/// Current snapshot of one node plus a publication counter.
pub struct NodeCell {
    current: ArcSwap<NodeSnapshot>,
    generation: AtomicU64,
}

impl NodeCell {
    pub fn new(initial: NodeSnapshot) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
            generation: AtomicU64::new(0),
        }
    }

    /// The latest published snapshot.
    pub fn load(&self) -> Arc<NodeSnapshot> {
        self.current.load_full()
    }

    /// Replace the snapshot; returns the new generation.
    pub fn publish(&self, next: NodeSnapshot) -> u64 {
        self.current.store(Arc::new(next));
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of snapshots published since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
