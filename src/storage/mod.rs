//! Page-level storage for XML documents.
//!
//! Leaves keep nodes in document order as bracket-encoded delta keys,
//! branches route identifiers to child pages, and the context layer ties a
//! latched page to logging and blob externalization.

/// Bracket-encoded leaf pages.
///
/// Key codec, identifier reconstruction, node sequences, navigation and
/// structural maintenance on the compressed form.
pub mod bracket;

/// Branch pages mapping separators to children.
pub mod branch;

/// Latched page contexts and the factory creating them.
pub mod context;

mod options;
mod stats;

pub use bracket::{
    BracketLeaf, DeleteApplied, DeleteEvent, DeleteOutcome, DeletePlan, LeafCursor, NavigationMode, NavigationStatus,
    NodeSequence, OwnedValue, SearchMode, StoredValue,
};
pub use branch::BranchPage;
pub use context::{
    BlobDisposal, BranchContext, BranchSplit, LatchedContext, LeafContext, LeafSplit, PageContext,
    PageContextFactory, SplitAt, SplitSide, Tx,
};
pub use options::StoreOptions;
pub use stats::{PageStats, PageStatsSnapshot};
