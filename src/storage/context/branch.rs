use std::sync::Arc;

use tracing::debug;

use crate::primitives::buffer::{LatchMode, PageHandle};
use crate::primitives::log::PageOperation;
use crate::storage::bracket::page::BracketLeaf;
use crate::storage::bracket::value::OwnedValue;
use crate::storage::branch::page::{BranchInsert, BranchPage, BranchUpdate};
use crate::types::page::PageKind;
use crate::types::{ArborError, DeweyId, Lsn, PageId, Result};

use super::{log_on, BlobDisposal, ContextCore, LatchedContext, LeafContext, StoreServices, Tx};

/// Result of [`BranchContext::split`].
#[derive(Debug)]
pub struct BranchSplit {
    /// Separator to insert into the parent, pointing at `right`.
    pub separator: DeweyId,
    /// Context of the new right branch, exclusively latched.
    pub right: BranchContext,
}

/// Context over a branch page.
pub struct BranchContext {
    core: ContextCore,
}

impl BranchContext {
    pub(crate) fn new(handle: PageHandle, services: Arc<StoreServices>) -> Self {
        Self {
            core: ContextCore::new(handle, services),
        }
    }

    fn branch(&self) -> Result<BranchPage<&[u8]>> {
        BranchPage::open(self.core.handle.bytes()?)
    }

    fn branch_mut(&mut self) -> Result<BranchPage<&mut [u8]>> {
        BranchPage::open(self.core.handle.bytes_mut()?)
    }

    /// Read-only view of the page.
    pub fn page(&self) -> Result<BranchPage<&[u8]>> {
        self.branch()
    }

    /// Number of separators.
    pub fn len(&self) -> Result<usize> {
        Ok(self.branch()?.len())
    }

    /// True when the page holds no separator.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.branch()?.is_empty())
    }

    /// Child left of the first separator.
    pub fn low_child(&self) -> Result<Option<PageId>> {
        Ok(self.branch()?.low_child())
    }

    /// Child whose key range holds `key`.
    pub fn search(&self, key: &DeweyId) -> Result<Option<PageId>> {
        self.branch()?.search(key)
    }

    /// Child right of the one [`BranchContext::search`] returns.
    pub fn search_next_page_id(&self, key: &DeweyId) -> Result<Option<PageId>> {
        self.branch()?.search_next_page_id(key)
    }

    /// Child of the rightmost separator inside `key`'s subtree.
    pub fn find_greatest_inside(&self, key: &DeweyId) -> Result<Option<PageId>> {
        self.branch()?.find_greatest_inside(key)
    }

    /// Value stored under `key`, read through the blob store when externalized.
    pub fn value(&self, key: &DeweyId) -> Result<Option<Vec<u8>>> {
        let branch = self.branch()?;
        match branch.position(key)? {
            Ok(idx) => self.core.read_value(branch.value_at(idx)?).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Separators with their stored values.
    pub fn entries(&self) -> Result<Vec<(DeweyId, OwnedValue)>> {
        self.branch()?.entries()
    }

    /// Replaces the low child pointer.
    pub fn set_low_child(&mut self, tx: &Tx, child: Option<PageId>, logged: bool) -> Result<()> {
        let before = {
            let mut branch = self.branch_mut()?;
            let before = branch.low_child();
            branch.set_low_child(child);
            before
        };
        self.core.log(tx, logged, PageOperation::SetLowChild { before, after: child })?;
        Ok(())
    }

    /// Inserts a separator. Values above the branch inline threshold are
    /// externalized. Returns false when the page lacks space.
    pub fn insert(&mut self, tx: &Tx, key: &DeweyId, value: &[u8], logged: bool) -> Result<bool> {
        let threshold = self.core.services.options.effective_branch_inline_threshold();
        let stored = self.core.prepare_value(value, threshold)?;
        let outcome = self.branch_mut().and_then(|mut b| b.insert(key, stored.as_stored()));
        match outcome {
            Ok(BranchInsert::Inserted(_)) => {
                self.core.services.stats.inc_branch_inserts();
                self.core.log(
                    tx,
                    logged,
                    PageOperation::BranchInsert {
                        key: key.clone(),
                        value: stored,
                    },
                )?;
                Ok(true)
            }
            Ok(BranchInsert::NoSpace) => {
                self.core.discard_value(&stored)?;
                Ok(false)
            }
            Err(err) => {
                let _ = self.core.discard_value(&stored);
                Err(err)
            }
        }
    }

    /// Inserts a separator routing to `child`.
    pub fn insert_child(&mut self, tx: &Tx, key: &DeweyId, child: PageId, logged: bool) -> Result<bool> {
        self.insert(tx, key, &child.0.to_be_bytes(), logged)
    }

    /// Removes the separator `key`. Fails with [`ArborError::NotFound`] when
    /// it is absent.
    pub fn delete(&mut self, tx: &Tx, key: &DeweyId, logged: bool, mut disposal: BlobDisposal<'_>) -> Result<OwnedValue> {
        let page = self.page_id();
        let idx = match self.branch()?.position(key)? {
            Ok(idx) => idx,
            Err(_) => return Err(ArborError::NotFound.at_page(page)),
        };
        let (key, value) = self.branch_mut()?.delete(idx)?;
        self.core.log(
            tx,
            logged,
            PageOperation::BranchDelete {
                key,
                value: value.clone(),
            },
        )?;
        if let Some(blob) = value.external() {
            self.core.dispose(&[blob], &mut disposal)?;
        }
        Ok(value)
    }

    /// Replaces the value of `key`. A superseded blob is dropped right away.
    /// Returns false when the page lacks space.
    pub fn set_value(&mut self, tx: &Tx, key: &DeweyId, value: &[u8], logged: bool) -> Result<bool> {
        let page = self.page_id();
        let idx = match self.branch()?.position(key)? {
            Ok(idx) => idx,
            Err(_) => return Err(ArborError::NotFound.at_page(page)),
        };
        let threshold = self.core.services.options.effective_branch_inline_threshold();
        let stored = self.core.prepare_value(value, threshold)?;
        let outcome = self.branch_mut().and_then(|mut b| b.set_value(idx, stored.as_stored()));
        match outcome {
            Ok(BranchUpdate::Updated(before)) => {
                self.core.log(
                    tx,
                    logged,
                    PageOperation::BranchUpdate {
                        key: key.clone(),
                        before: before.clone(),
                        after: stored,
                    },
                )?;
                if let Some(blob) = before.external() {
                    self.core.dispose(&[blob], &mut BlobDisposal::Immediate)?;
                }
                Ok(true)
            }
            Ok(BranchUpdate::NoSpace) => {
                self.core.discard_value(&stored)?;
                Ok(false)
            }
            Err(err) => {
                let _ = self.core.discard_value(&stored);
                Err(err)
            }
        }
    }

    /// Moves the upper half into a newly allocated branch and returns the
    /// promoted separator.
    pub fn split(&mut self, tx: &Tx, logged: bool) -> Result<BranchSplit> {
        let services = Arc::clone(&self.core.services);
        let left_id = self.page_id();
        let mut handle = services.buffer.allocate()?;
        let right_id = handle.id();
        let split = (|| -> Result<DeweyId> {
            let mut right = BranchPage::format(handle.bytes_mut()?, right_id, None)?;
            let mut left = BranchPage::open(self.core.handle.bytes_mut()?)?;
            left.split_into(&mut right)
        })();
        let separator = match split {
            Ok(separator) => separator,
            Err(err) => {
                drop(handle);
                let _ = services.buffer.delete_deferred(right_id);
                return Err(err);
            }
        };
        services.stats.inc_branch_splits();
        services.stats.inc_pages_formatted();
        self.core.log(
            tx,
            logged,
            PageOperation::BranchSplit {
                right: right_id,
                separator: separator.clone(),
            },
        )?;
        log_on(&services, &mut handle, tx, logged, PageOperation::Format { kind: PageKind::Branch })?;
        debug!(left = left_id.0, right = right_id.0, %separator, "branch.split");
        Ok(BranchSplit {
            separator,
            right: BranchContext::new(handle, services),
        })
    }

    /// Re-formats the page as an empty leaf. Blobs still referenced by
    /// separators go to `disposal`.
    pub fn into_leaf(mut self, tx: &Tx, logged: bool, mut disposal: BlobDisposal<'_>) -> Result<LeafContext> {
        let page = self.page_id();
        let blobs: Vec<PageId> = self
            .entries()?
            .iter()
            .filter_map(|(_, value)| value.external())
            .collect();
        BracketLeaf::format(self.core.handle.bytes_mut()?, page)?;
        self.core.services.stats.inc_pages_formatted();
        self.core.log(tx, logged, PageOperation::Format { kind: PageKind::Leaf })?;
        self.core.dispose(&blobs, &mut disposal)?;
        Ok(LeafContext::new(self.core.handle, self.core.services))
    }
}

impl LatchedContext for BranchContext {
    fn page_id(&self) -> PageId {
        self.core.page_id()
    }

    fn latch_mode(&self) -> Option<LatchMode> {
        self.core.handle.mode()
    }

    fn upgrade(&mut self) -> Result<()> {
        self.core.handle.upgrade()
    }

    fn downgrade(&mut self) -> Result<()> {
        self.core.handle.downgrade()
    }

    fn unlatch(&mut self) {
        self.core.handle.unlatch()
    }

    fn lsn(&self) -> Result<Lsn> {
        self.core.lsn()
    }
}

impl std::fmt::Debug for BranchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchContext")
            .field("page", &self.core.page_id())
            .finish()
    }
}
