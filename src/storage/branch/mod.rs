#![forbid(unsafe_code)]
//! Slotted branch pages holding `(separator, value)` records.

pub mod page;

pub use page::{BranchInsert, BranchPage, BranchRecordRef, BranchUpdate, Header};
