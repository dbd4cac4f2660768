//! Entry point that turns page ids into typed, latched contexts.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::blob::BlobStore;
use crate::primitives::buffer::{LatchMode, PageBuffer, PageHandle};
use crate::primitives::log::{LogFacility, PageOperation};
use crate::storage::bracket::page::BracketLeaf;
use crate::storage::branch::page::BranchPage;
use crate::storage::options::StoreOptions;
use crate::storage::stats::{PageStats, PageStatsSnapshot};
use crate::types::page::{self, PageKind};
use crate::types::{ArborError, PageId, Result};

use super::{log_on, BranchContext, LeafContext, PageContext, StoreServices, Tx};

/// Creates leaf and branch contexts over pages of one buffer.
#[derive(Clone, Debug)]
pub struct PageContextFactory {
    services: Arc<StoreServices>,
}

impl PageContextFactory {
    /// Validates `options` against the buffer and wires the services together.
    pub fn new(
        buffer: Arc<dyn PageBuffer>,
        blobs: Arc<dyn BlobStore>,
        log: Arc<dyn LogFacility>,
        options: StoreOptions,
    ) -> Result<Self> {
        options.validate()?;
        if buffer.page_size() != options.page_size {
            return Err(ArborError::Config(format!(
                "buffer page size {} does not match configured {}",
                buffer.page_size(),
                options.page_size
            )));
        }
        debug!(
            page_size = options.page_size,
            inline_threshold = options.effective_inline_threshold(),
            branch_inline_threshold = options.effective_branch_inline_threshold(),
            "factory.new"
        );
        Ok(Self {
            services: Arc::new(StoreServices {
                buffer,
                blobs,
                log,
                options,
                stats: Arc::new(PageStats::default()),
            }),
        })
    }

    /// Options in effect.
    pub fn options(&self) -> &StoreOptions {
        &self.services.options
    }

    /// Counters of all contexts created by this factory.
    pub fn stats(&self) -> PageStatsSnapshot {
        self.services.stats.snapshot()
    }

    /// Shared counters, e.g. for periodic [`PageStats::emit_tracing`].
    pub fn stats_handle(&self) -> Arc<PageStats> {
        Arc::clone(&self.services.stats)
    }

    fn fix(&self, page: PageId, mode: LatchMode) -> Result<(PageHandle, PageKind)> {
        let handle = self.services.buffer.fix(page, mode)?;
        let bytes = handle.bytes()?;
        if self.services.options.verify_checksums {
            page::verify(bytes).map_err(|err| err.at_page(page))?;
        }
        let kind = page::read_kind(bytes).map_err(|err| err.at_page(page))?;
        trace!(page = page.0, ?mode, ?kind, "factory.fetch");
        Ok((handle, kind))
    }

    /// Fixes `page` in `mode` and returns the context matching its kind.
    pub fn fetch(&self, page: PageId, mode: LatchMode) -> Result<PageContext> {
        let (handle, kind) = self.fix(page, mode)?;
        match kind {
            PageKind::Leaf => Ok(PageContext::Leaf(LeafContext::new(handle, Arc::clone(&self.services)))),
            PageKind::Branch => Ok(PageContext::Branch(BranchContext::new(handle, Arc::clone(&self.services)))),
            PageKind::Overflow => Err(ArborError::Invalid("overflow pages have no context").at_page(page)),
        }
    }

    /// Fetches a page that must be a leaf.
    pub fn fetch_leaf(&self, page: PageId, mode: LatchMode) -> Result<LeafContext> {
        self.fetch(page, mode)?.into_leaf()
    }

    /// Fetches a page that must be a branch.
    pub fn fetch_branch(&self, page: PageId, mode: LatchMode) -> Result<BranchContext> {
        self.fetch(page, mode)?.into_branch()
    }

    /// Allocates and formats an empty leaf, exclusively latched.
    pub fn allocate_leaf(&self, tx: &Tx, logged: bool) -> Result<LeafContext> {
        let mut handle = self.services.buffer.allocate()?;
        let id = handle.id();
        let formatted = BracketLeaf::format(handle.bytes_mut()?, id)
            .map(|_| ())
            .and_then(|_| log_on(&self.services, &mut handle, tx, logged, PageOperation::Format { kind: PageKind::Leaf }));
        if let Err(err) = formatted {
            drop(handle);
            let _ = self.services.buffer.delete_deferred(id);
            return Err(err);
        }
        self.services.stats.inc_pages_formatted();
        debug!(page = id.0, "factory.allocate_leaf");
        Ok(LeafContext::new(handle, Arc::clone(&self.services)))
    }

    /// Allocates and formats an empty branch routing everything to `low_child`.
    pub fn allocate_branch(&self, tx: &Tx, low_child: Option<PageId>, logged: bool) -> Result<BranchContext> {
        let mut handle = self.services.buffer.allocate()?;
        let id = handle.id();
        let formatted = BranchPage::format(handle.bytes_mut()?, id, low_child)
            .map(|_| ())
            .and_then(|_| log_on(&self.services, &mut handle, tx, logged, PageOperation::Format { kind: PageKind::Branch }))
            .and_then(|_| {
                log_on(
                    &self.services,
                    &mut handle,
                    tx,
                    logged,
                    PageOperation::SetLowChild {
                        before: None,
                        after: low_child,
                    },
                )
            });
        if let Err(err) = formatted {
            drop(handle);
            let _ = self.services.buffer.delete_deferred(id);
            return Err(err);
        }
        self.services.stats.inc_pages_formatted();
        debug!(page = id.0, ?low_child, "factory.allocate_branch");
        Ok(BranchContext::new(handle, Arc::clone(&self.services)))
    }

    /// Stores the page checksum, as done before a page leaves memory.
    pub fn seal(&self, page: PageId) -> Result<u32> {
        let mut handle = self.services.buffer.fix(page, LatchMode::Exclusive)?;
        page::seal(handle.bytes_mut()?).map_err(|err| err.at_page(page))
    }
}
