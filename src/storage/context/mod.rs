#![forbid(unsafe_code)]
//! Page contexts: a latched page plus the services needed to mutate it.
//!
//! A context owns the [`PageHandle`] of one page for the duration of a
//! logical operation. Mutations optionally write a log record and stamp the
//! returned LSN into the page header; large values are moved to the blob
//! store before they reach the page.

mod branch;
pub mod factory;
mod leaf;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::blob::BlobStore;
use crate::primitives::buffer::{LatchMode, PageBuffer, PageHandle};
use crate::primitives::log::{LogFacility, LogRecord, PageOperation};
use crate::storage::bracket::value::{OwnedValue, StoredValue};
use crate::storage::options::StoreOptions;
use crate::storage::stats::PageStats;
use crate::types::page;
use crate::types::{ArborError, Lsn, PageId, Result, TxId};

pub use branch::{BranchContext, BranchSplit};
pub use factory::PageContextFactory;
pub use leaf::{LeafContext, LeafSplit, SplitAt, SplitSide};

/// Transaction state the contexts need for logging.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tx {
    /// Transaction id written into every record.
    pub id: TxId,
    /// Set while rolling back; records become compensations chained to it.
    pub undo_next_lsn: Option<Lsn>,
}

impl Tx {
    /// Forward-processing transaction.
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            undo_next_lsn: None,
        }
    }

    /// Same transaction during rollback, with `undo_next` as the next LSN to undo.
    pub fn rolling_back(self, undo_next: Lsn) -> Self {
        Self {
            undo_next_lsn: Some(undo_next),
            ..self
        }
    }
}

/// What happens to blobs no longer referenced after a mutation.
#[derive(Debug)]
pub enum BlobDisposal<'a> {
    /// Drop them right away.
    Immediate,
    /// Hand them to the caller, e.g. for dropping at commit.
    Deferred(&'a mut Vec<PageId>),
}

/// Services shared by the factory and every context it creates.
pub struct StoreServices {
    pub(crate) buffer: Arc<dyn PageBuffer>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) log: Arc<dyn LogFacility>,
    pub(crate) options: StoreOptions,
    pub(crate) stats: Arc<PageStats>,
}

impl std::fmt::Debug for StoreServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreServices")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Common surface of leaf and branch contexts.
pub trait LatchedContext {
    /// Page the context operates on.
    fn page_id(&self) -> PageId;
    /// Held latch mode, `None` after [`LatchedContext::unlatch`].
    fn latch_mode(&self) -> Option<LatchMode>;
    /// Upgrades an update latch to exclusive.
    fn upgrade(&mut self) -> Result<()>;
    /// Downgrades an exclusive latch to update mode.
    fn downgrade(&mut self) -> Result<()>;
    /// Releases the latch. Idempotent; the page stays fixed until drop.
    fn unlatch(&mut self);
    /// LSN stored in the page header.
    fn lsn(&self) -> Result<Lsn>;
}

/// Context resolved from the kind byte of a fetched page.
#[derive(Debug)]
pub enum PageContext {
    /// Bracket leaf.
    Leaf(LeafContext),
    /// Branch page.
    Branch(BranchContext),
}

impl PageContext {
    /// The leaf context, if this is one.
    pub fn into_leaf(self) -> Result<LeafContext> {
        match self {
            PageContext::Leaf(ctx) => Ok(ctx),
            PageContext::Branch(ctx) => Err(ArborError::Invalid("page is a branch").at_page(ctx.page_id())),
        }
    }

    /// The branch context, if this is one.
    pub fn into_branch(self) -> Result<BranchContext> {
        match self {
            PageContext::Branch(ctx) => Ok(ctx),
            PageContext::Leaf(ctx) => Err(ArborError::Invalid("page is a leaf").at_page(ctx.page_id())),
        }
    }

    fn inner(&self) -> &dyn LatchedContext {
        match self {
            PageContext::Leaf(ctx) => ctx,
            PageContext::Branch(ctx) => ctx,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LatchedContext {
        match self {
            PageContext::Leaf(ctx) => ctx,
            PageContext::Branch(ctx) => ctx,
        }
    }
}

impl LatchedContext for PageContext {
    fn page_id(&self) -> PageId {
        self.inner().page_id()
    }

    fn latch_mode(&self) -> Option<LatchMode> {
        self.inner().latch_mode()
    }

    fn upgrade(&mut self) -> Result<()> {
        self.inner_mut().upgrade()
    }

    fn downgrade(&mut self) -> Result<()> {
        self.inner_mut().downgrade()
    }

    fn unlatch(&mut self) {
        self.inner_mut().unlatch()
    }

    fn lsn(&self) -> Result<Lsn> {
        self.inner().lsn()
    }
}

/// Follows every page mutation: clears the page checksum, then writes `op`
/// for `handle`'s page when `logged` and stamps the LSN.
pub(crate) fn log_on(
    services: &StoreServices,
    handle: &mut PageHandle,
    tx: &Tx,
    logged: bool,
    op: PageOperation,
) -> Result<Option<Lsn>> {
    page::clear_crc32(handle.bytes_mut()?)?;
    if !logged {
        return Ok(None);
    }
    let record = LogRecord {
        tx: tx.id,
        page: handle.id(),
        op,
    };
    let lsn = match tx.undo_next_lsn {
        Some(undo_next) => services.log.log_clr(&record, undo_next)?,
        None => services.log.log_update(&record)?,
    };
    page::write_lsn(handle.bytes_mut()?, lsn)?;
    trace!(page = handle.id().0, lsn = lsn.0, clr = tx.undo_next_lsn.is_some(), "context.log");
    Ok(Some(lsn))
}

/// State shared by leaf and branch contexts.
pub(crate) struct ContextCore {
    pub(crate) handle: PageHandle,
    pub(crate) services: Arc<StoreServices>,
}

impl ContextCore {
    pub(crate) fn new(handle: PageHandle, services: Arc<StoreServices>) -> Self {
        Self { handle, services }
    }

    pub(crate) fn page_id(&self) -> PageId {
        self.handle.id()
    }

    pub(crate) fn log(&mut self, tx: &Tx, logged: bool, op: PageOperation) -> Result<Option<Lsn>> {
        log_on(&self.services, &mut self.handle, tx, logged, op)
    }

    /// Stores `bytes` as `Inline` when at most `threshold` long, else in a new blob.
    pub(crate) fn prepare_value(&self, bytes: &[u8], threshold: usize) -> Result<OwnedValue> {
        if bytes.len() <= threshold {
            return Ok(OwnedValue::Inline(bytes.to_vec()));
        }
        let blob = self.services.blobs.create()?;
        if let Err(err) = self.services.blobs.write(blob, bytes) {
            let _ = self.services.blobs.drop_blob(blob);
            return Err(err);
        }
        self.services.stats.inc_externalized_values();
        debug!(page = self.page_id().0, blob = blob.0, len = bytes.len(), "context.externalize");
        Ok(OwnedValue::External(blob))
    }

    /// Drops a blob created by [`ContextCore::prepare_value`] that never
    /// reached the page.
    pub(crate) fn discard_value(&self, value: &OwnedValue) -> Result<()> {
        match value {
            OwnedValue::External(blob) => self.services.blobs.drop_blob(*blob),
            OwnedValue::Inline(_) => Ok(()),
        }
    }

    pub(crate) fn read_value(&self, value: StoredValue<'_>) -> Result<Vec<u8>> {
        match value {
            StoredValue::Inline(bytes) => Ok(bytes.to_vec()),
            StoredValue::External(blob) => self.services.blobs.read(blob),
        }
    }

    pub(crate) fn dispose(&self, blobs: &[PageId], disposal: &mut BlobDisposal<'_>) -> Result<()> {
        if blobs.is_empty() {
            return Ok(());
        }
        match disposal {
            BlobDisposal::Immediate => {
                for blob in blobs {
                    self.services.blobs.drop_blob(*blob)?;
                }
                self.services.stats.add_dropped_blobs(blobs.len() as u64);
                trace!(page = self.page_id().0, blobs = blobs.len(), "context.drop_blobs");
            }
            BlobDisposal::Deferred(pending) => pending.extend_from_slice(blobs),
        }
        Ok(())
    }

    pub(crate) fn lsn(&self) -> Result<Lsn> {
        page::read_lsn(self.handle.bytes()?)
    }
}
