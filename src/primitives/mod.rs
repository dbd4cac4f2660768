//! Low-level primitives the page layer builds on.
//!
//! Includes byte utilities, the latched page buffer, overflow blobs and
//! the log facility.

/// Byte-level utilities and encoding/decoding.
///
/// Fixed-width integer access, a bounds-checked reader and the
/// order-preserving division codec.
pub mod bytes;

/// Pinned, latched page frames.
pub mod buffer;

/// Values too large for their page, stored in overflow chains.
pub mod blob;

/// Page operation records and the facilities that persist them.
pub mod log;
