use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of page-context counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStatsSnapshot {
    /// Nodes inserted into leaves
    pub leaf_inserts: u64,
    /// Delete operations applied to leaves
    pub leaf_deletes: u64,
    /// Leaf splits
    pub leaf_splits: u64,
    /// Records inserted into branches
    pub branch_inserts: u64,
    /// Branch splits
    pub branch_splits: u64,
    /// Values moved out of their page into a blob
    pub externalized_values: u64,
    /// Blobs released
    pub dropped_blobs: u64,
    /// Pages formatted as leaf or branch
    pub pages_formatted: u64,
}

/// Thread-safe counters shared by the factory and its contexts.
#[derive(Default, Debug)]
pub struct PageStats {
    leaf_inserts: AtomicU64,
    leaf_deletes: AtomicU64,
    leaf_splits: AtomicU64,
    branch_inserts: AtomicU64,
    branch_splits: AtomicU64,
    externalized_values: AtomicU64,
    dropped_blobs: AtomicU64,
    pages_formatted: AtomicU64,
}

impl PageStats {
    pub(crate) fn inc_leaf_inserts(&self) {
        self.leaf_inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_deletes(&self) {
        self.leaf_deletes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_branch_inserts(&self) {
        self.branch_inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_branch_splits(&self) {
        self.branch_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_externalized_values(&self) {
        self.externalized_values.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_dropped_blobs(&self, count: u64) {
        self.dropped_blobs.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pages_formatted(&self) {
        self.pages_formatted.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all counters.
    pub fn snapshot(&self) -> PageStatsSnapshot {
        PageStatsSnapshot {
            leaf_inserts: self.leaf_inserts.load(AtomicOrdering::Relaxed),
            leaf_deletes: self.leaf_deletes.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            branch_inserts: self.branch_inserts.load(AtomicOrdering::Relaxed),
            branch_splits: self.branch_splits.load(AtomicOrdering::Relaxed),
            externalized_values: self.externalized_values.load(AtomicOrdering::Relaxed),
            dropped_blobs: self.dropped_blobs.load(AtomicOrdering::Relaxed),
            pages_formatted: self.pages_formatted.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current counters to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "arbor::stats",
            leaf_inserts = snapshot.leaf_inserts,
            leaf_deletes = snapshot.leaf_deletes,
            leaf_splits = snapshot.leaf_splits,
            branch_inserts = snapshot.branch_inserts,
            branch_splits = snapshot.branch_splits,
            externalized_values = snapshot.externalized_values,
            dropped_blobs = snapshot.dropped_blobs,
            pages_formatted = snapshot.pages_formatted,
            "page stats snapshot"
        );
    }
}
