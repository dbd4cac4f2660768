//! Arbor: page-level storage engine for XML documents.
//!
//! Nodes are addressed by hierarchical [`types::DeweyId`]s and stored in
//! document order inside bracket-encoded leaf pages. Branch pages route
//! identifiers to leaves, and [`storage::PageContextFactory`] hands out
//! latched contexts that log their changes and move large values into
//! overflow blobs.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{PageContextFactory, StoreOptions, Tx};
pub use types::{ArborError, DeweyId, PageId, Result};
