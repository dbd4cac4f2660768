use std::sync::Arc;

use tracing::debug;

use crate::primitives::buffer::{LatchMode, PageHandle};
use crate::primitives::log::{LogRecord, PageOperation};
use crate::storage::bracket::maintenance::{
    DeleteApplied, DeleteEvent, DeleteOutcome, DeletePlan, SplitPoint, SubtreeRemainder,
};
use crate::storage::bracket::navigation::{NavigationMode, NavigationStatus, SearchMode};
use crate::storage::bracket::page::{BracketLeaf, InsertOutcome, LeafCursor, UpdateOutcome};
use crate::storage::bracket::value::OwnedValue;
use crate::storage::branch::page::BranchPage;
use crate::types::page::PageKind;
use crate::types::{ArborError, DeweyId, Lsn, PageId, Result};

use super::{log_on, BlobDisposal, BranchContext, ContextCore, LatchedContext, StoreServices, Tx};

/// Where [`LeafContext::split`] cuts the page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SplitAt {
    /// At the configured split occupancy.
    Occupancy,
    /// Directly after the node under the cursor.
    Cursor,
}

/// Which page holds the addressed key after a split.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SplitSide {
    /// The original page.
    Left,
    /// The newly allocated right sibling.
    Right,
}

/// Result of [`LeafContext::split`].
#[derive(Debug)]
pub struct LeafSplit {
    /// New high key of the left page and low key of the right one.
    pub separator: DeweyId,
    /// Context of the new right sibling, exclusively latched.
    pub right: LeafContext,
    /// Page that now holds the addressed key.
    pub side: SplitSide,
    /// Outcome of re-navigating to the addressed key on that side.
    pub status: NavigationStatus,
}

/// Context over a bracket leaf, carrying a cursor into the page.
pub struct LeafContext {
    core: ContextCore,
    cursor: LeafCursor,
}

impl LeafContext {
    pub(crate) fn new(handle: PageHandle, services: Arc<StoreServices>) -> Self {
        Self {
            core: ContextCore::new(handle, services),
            cursor: LeafCursor::before_first(),
        }
    }

    fn leaf(&self) -> Result<BracketLeaf<&[u8]>> {
        BracketLeaf::open(self.core.handle.bytes()?)
    }

    fn leaf_mut(handle: &mut PageHandle) -> Result<BracketLeaf<&mut [u8]>> {
        BracketLeaf::open(handle.bytes_mut()?)
    }

    /// Read-only view of the page.
    pub fn page(&self) -> Result<BracketLeaf<&[u8]>> {
        self.leaf()
    }

    /// Current cursor.
    pub fn cursor(&self) -> &LeafCursor {
        &self.cursor
    }

    /// Replaces the cursor, e.g. with one saved before unlatching.
    pub fn set_cursor(&mut self, cursor: LeafCursor) {
        self.cursor = cursor;
    }

    /// Identifier under the cursor.
    pub fn key(&self) -> Option<&DeweyId> {
        self.cursor.id()
    }

    /// Value under the cursor as stored in the page.
    pub fn stored_value(&self) -> Result<OwnedValue> {
        Ok(self.leaf()?.value(&self.cursor)?.to_owned_value())
    }

    /// Value under the cursor, read through the blob store when externalized.
    pub fn value(&self) -> Result<Vec<u8>> {
        let leaf = self.leaf()?;
        self.core.read_value(leaf.value(&self.cursor)?)
    }

    /// Left neighbour.
    pub fn prev_page(&self) -> Result<Option<PageId>> {
        Ok(self.leaf()?.prev_page())
    }

    /// Right neighbour.
    pub fn next_page(&self) -> Result<Option<PageId>> {
        Ok(self.leaf()?.next_page())
    }

    /// High key of the page.
    pub fn high_key(&self) -> Result<Option<DeweyId>> {
        self.leaf()?.high_key()
    }

    /// Moves to the first node.
    pub fn move_first(&mut self) -> Result<bool> {
        let leaf = BracketLeaf::open(self.core.handle.bytes()?)?;
        leaf.move_first(&mut self.cursor)
    }

    /// Moves to the next node.
    pub fn move_next(&mut self) -> Result<bool> {
        let leaf = BracketLeaf::open(self.core.handle.bytes()?)?;
        leaf.move_next(&mut self.cursor)
    }

    /// Moves to the last node.
    pub fn move_last(&mut self) -> Result<bool> {
        let leaf = BracketLeaf::open(self.core.handle.bytes()?)?;
        leaf.move_last(&mut self.cursor)
    }

    /// Moves to the previous node.
    pub fn move_previous(&mut self) -> Result<bool> {
        let leaf = BracketLeaf::open(self.core.handle.bytes()?)?;
        leaf.move_previous(&mut self.cursor)
    }

    /// Structural navigation from the current node.
    pub fn navigate(&mut self, mode: NavigationMode) -> Result<NavigationStatus> {
        let leaf = BracketLeaf::open(self.core.handle.bytes()?)?;
        leaf.navigate(&mut self.cursor, mode)
    }

    /// Navigation to `key` from the low key.
    pub fn navigate_to(&mut self, key: &DeweyId, mode: SearchMode) -> Result<NavigationStatus> {
        let leaf = BracketLeaf::open(self.core.handle.bytes()?)?;
        leaf.navigate_context_free(&mut self.cursor, key, mode)
    }

    /// Inserts `id` behind the cursor and moves onto it. Values above the
    /// inline threshold are externalized first. Returns false without
    /// changing the page when it lacks space.
    pub fn insert_after(&mut self, tx: &Tx, id: &DeweyId, value: &[u8], logged: bool) -> Result<bool> {
        let threshold = self.core.services.options.effective_inline_threshold();
        let stored = self.core.prepare_value(value, threshold)?;
        let inserted = self.insert_stored(tx, id, &stored, logged);
        match inserted {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.core.discard_value(&stored)?;
                Ok(false)
            }
            Err(err) => {
                let _ = self.core.discard_value(&stored);
                Err(err)
            }
        }
    }

    fn insert_stored(&mut self, tx: &Tx, id: &DeweyId, value: &OwnedValue, logged: bool) -> Result<bool> {
        let outcome = {
            let mut leaf = Self::leaf_mut(&mut self.core.handle)?;
            leaf.insert_after(&self.cursor, id, value.as_stored())?
        };
        match outcome {
            InsertOutcome::NoSpace => Ok(false),
            InsertOutcome::Inserted(cursor) => {
                self.cursor = cursor;
                self.core.services.stats.inc_leaf_inserts();
                self.core.log(
                    tx,
                    logged,
                    PageOperation::LeafInsert {
                        id: id.clone(),
                        value: value.clone(),
                    },
                )?;
                Ok(true)
            }
        }
    }

    /// Replaces the value under the cursor. The superseded blob, if any, is
    /// handed to `disposal`. Returns false when the page lacks space.
    pub fn set_value(&mut self, tx: &Tx, value: &[u8], logged: bool, mut disposal: BlobDisposal<'_>) -> Result<bool> {
        let threshold = self.core.services.options.effective_inline_threshold();
        let stored = self.core.prepare_value(value, threshold)?;
        match self.set_stored(tx, &stored, logged) {
            Ok(Some(previous)) => {
                if let OwnedValue::External(blob) = previous {
                    self.core.dispose(&[blob], &mut disposal)?;
                }
                Ok(true)
            }
            Ok(None) => {
                self.core.discard_value(&stored)?;
                Ok(false)
            }
            Err(err) => {
                let _ = self.core.discard_value(&stored);
                Err(err)
            }
        }
    }

    fn set_stored(&mut self, tx: &Tx, value: &OwnedValue, logged: bool) -> Result<Option<OwnedValue>> {
        let id = self
            .cursor
            .id()
            .cloned()
            .ok_or(ArborError::Invalid("cursor is not positioned on a node"))?;
        let outcome = {
            let mut leaf = Self::leaf_mut(&mut self.core.handle)?;
            leaf.set_value(&self.cursor, value.as_stored())?
        };
        match outcome {
            UpdateOutcome::NoSpace => Ok(None),
            UpdateOutcome::Updated(before) => {
                self.core.log(
                    tx,
                    logged,
                    PageOperation::LeafUpdate {
                        id,
                        before: before.clone(),
                        after: value.clone(),
                    },
                )?;
                Ok(Some(before))
            }
        }
    }

    /// Dry run of deleting the subtree under the cursor.
    pub fn delete_prepare<F>(&self, visitor: F) -> Result<DeletePlan>
    where
        F: FnMut(DeleteEvent<'_>) -> Result<()>,
    {
        self.leaf()?.delete_prepare(&self.cursor, visitor)
    }

    /// Dry run of deleting the leading nodes that belong to `root`'s subtree.
    pub fn delete_remaining_subtree<F>(&self, root: &DeweyId, visitor: F) -> Result<SubtreeRemainder>
    where
        F: FnMut(DeleteEvent<'_>) -> Result<()>,
    {
        self.leaf()?.delete_remaining_subtree(root, visitor)
    }

    /// Applies a plan from [`LeafContext::delete_prepare`]. Fails with
    /// [`ArborError::EmptyLeaf`] when the page would become empty; use
    /// [`LeafContext::unchain`] then. Returns `None` without changing the
    /// page when the re-encoded follower does not fit.
    pub fn delete(
        &mut self,
        tx: &Tx,
        plan: DeletePlan,
        logged: bool,
        mut disposal: BlobDisposal<'_>,
    ) -> Result<Option<DeleteOutcome>> {
        let before = if logged { self.leaf()?.entries()? } else { Vec::new() };
        let applied = {
            let mut leaf = Self::leaf_mut(&mut self.core.handle)?;
            leaf.delete(plan)?
        };
        let outcome = match applied {
            DeleteApplied::Deleted(outcome) => outcome,
            DeleteApplied::NoSpace => return Ok(None),
        };
        self.cursor = outcome.cursor.clone();
        self.core.services.stats.inc_leaf_deletes();
        if logged {
            let after = self.leaf()?.entries()?;
            let nodes = removed_nodes(before, &after);
            self.core.log(tx, logged, PageOperation::LeafDelete { nodes })?;
        }
        self.core.dispose(&outcome.externals, &mut disposal)?;
        debug!(page = self.page_id().0, removed = outcome.removed, "leaf.delete");
        Ok(Some(outcome))
    }

    /// Splits the page, moving the upper part into a newly allocated right
    /// sibling and fixing the sibling chain. The caller ends up on the side
    /// that holds `target` (default: the key under the cursor), re-navigated
    /// with the given mode.
    pub fn split(
        &mut self,
        tx: &Tx,
        at: SplitAt,
        target: Option<(&DeweyId, SearchMode)>,
        logged: bool,
    ) -> Result<LeafSplit> {
        let services = Arc::clone(&self.core.services);
        let left_id = self.page_id();
        let point = match at {
            SplitAt::Occupancy => SplitPoint::Occupancy(services.options.split_occupancy),
            SplitAt::Cursor => SplitPoint::After(
                self.cursor
                    .slot()
                    .ok_or(ArborError::Invalid("cursor is not positioned on a node"))?,
            ),
        };
        let target = match target {
            Some((key, mode)) => Some((key.clone(), mode)),
            None => self.cursor.id().cloned().map(|id| (id, SearchMode::ToKey)),
        };
        let mut handle = services.buffer.allocate()?;
        let right_id = handle.id();
        let split = (|| -> Result<_> {
            let mut right = BracketLeaf::format(handle.bytes_mut()?, right_id)?;
            let mut left = Self::leaf_mut(&mut self.core.handle)?;
            let outcome = left.split_into(&mut right, point)?;
            let old_next = left.next_page();
            right.set_prev_page(Some(left_id));
            right.set_next_page(old_next);
            left.set_next_page(Some(right_id));
            Ok((outcome, old_next))
        })();
        let (outcome, old_next) = match split {
            Ok(split) => split,
            Err(err) => {
                drop(handle);
                let _ = services.buffer.delete_deferred(right_id);
                return Err(err);
            }
        };
        services.stats.inc_leaf_splits();
        services.stats.inc_pages_formatted();
        self.core.log(
            tx,
            logged,
            PageOperation::LeafSplit {
                right: right_id,
                separator: outcome.separator.clone(),
            },
        )?;
        log_on(&services, &mut handle, tx, logged, PageOperation::Format { kind: PageKind::Leaf })?;
        if logged {
            let high = Self::leaf_mut(&mut handle)?.high_key()?;
            log_on(
                &services,
                &mut handle,
                tx,
                logged,
                PageOperation::LeafLoad {
                    high,
                    sequence: outcome.sequence.to_bytes()?,
                },
            )?;
        }
        log_on(
            &services,
            &mut handle,
            tx,
            logged,
            PageOperation::LeafLink {
                prev: Some(left_id),
                next: old_next,
            },
        )?;
        if let Some(next) = old_next {
            let mut neighbour = services.buffer.fix(next, LatchMode::Exclusive)?;
            let next_next = {
                let mut leaf = Self::leaf_mut(&mut neighbour)?;
                leaf.set_prev_page(Some(right_id));
                leaf.next_page()
            };
            log_on(
                &services,
                &mut neighbour,
                tx,
                logged,
                PageOperation::LeafLink {
                    prev: Some(right_id),
                    next: next_next,
                },
            )?;
        }
        debug!(
            left = left_id.0,
            right = right_id.0,
            kept = outcome.kept,
            moved = outcome.moved,
            "leaf.split"
        );
        let mut right = LeafContext::new(handle, services);
        let (side, status) = match target {
            Some((key, mode)) if key >= outcome.separator => {
                self.cursor = LeafCursor::before_first();
                (SplitSide::Right, right.navigate_to(&key, mode)?)
            }
            Some((key, mode)) => (SplitSide::Left, self.navigate_to(&key, mode)?),
            None => (SplitSide::Left, NavigationStatus::NotFound),
        };
        Ok(LeafSplit {
            separator: outcome.separator,
            right,
            side,
            status,
        })
    }

    /// Removes this leaf from the sibling chain and releases the page, its
    /// nodes and their blobs.
    pub fn unchain(mut self, tx: &Tx, logged: bool, mut disposal: BlobDisposal<'_>) -> Result<()> {
        let (prev, next, entries) = {
            let leaf = self.leaf()?;
            (leaf.prev_page(), leaf.next_page(), leaf.entries()?)
        };
        let blobs: Vec<PageId> = entries.iter().filter_map(|(_, value)| value.external()).collect();
        if !entries.is_empty() {
            self.core.log(tx, logged, PageOperation::LeafDelete { nodes: entries })?;
        }
        self.core.log(tx, logged, PageOperation::LeafUnchain { prev, next })?;
        let services = Arc::clone(&self.core.services);
        if let Some(prev_id) = prev {
            let mut handle = services.buffer.fix(prev_id, LatchMode::Exclusive)?;
            let prev_prev = {
                let mut leaf = Self::leaf_mut(&mut handle)?;
                leaf.set_next_page(next);
                leaf.prev_page()
            };
            log_on(&services, &mut handle, tx, logged, PageOperation::LeafLink { prev: prev_prev, next })?;
        }
        if let Some(next_id) = next {
            let mut handle = services.buffer.fix(next_id, LatchMode::Exclusive)?;
            let next_next = {
                let mut leaf = Self::leaf_mut(&mut handle)?;
                leaf.set_prev_page(prev);
                leaf.next_page()
            };
            log_on(&services, &mut handle, tx, logged, PageOperation::LeafLink { prev, next: next_next })?;
        }
        self.core.dispose(&blobs, &mut disposal)?;
        let page = self.page_id();
        drop(self);
        services.buffer.delete_deferred(page)?;
        debug!(page = page.0, ?prev, ?next, "leaf.unchain");
        Ok(())
    }

    /// Re-formats the page as an empty branch.
    pub fn into_branch(mut self, tx: &Tx, low_child: Option<PageId>, logged: bool) -> Result<BranchContext> {
        let page = self.page_id();
        BranchPage::format(self.core.handle.bytes_mut()?, page, low_child)?;
        self.core.services.stats.inc_pages_formatted();
        self.core.log(tx, logged, PageOperation::Format { kind: PageKind::Branch })?;
        Ok(BranchContext::new(self.core.handle, self.core.services))
    }

    /// Applies the inverse of a leaf record, logging a compensation.
    /// `tx.undo_next_lsn` must be set. Blobs of undone inserts are dropped.
    pub fn undo(&mut self, tx: &Tx, record: &LogRecord) -> Result<()> {
        if tx.undo_next_lsn.is_none() {
            return Err(ArborError::Invalid("undo requires a rolling-back transaction"));
        }
        if record.page != self.page_id() {
            return Err(ArborError::Invalid("record belongs to another page"));
        }
        match &record.op {
            PageOperation::LeafInsert { id, .. } => {
                self.position_on(id)?;
                let plan = self.delete_prepare(|_| Ok(()))?;
                if plan.nodes() != 1 {
                    return Err(ArborError::Invalid("inserted node still has descendants"));
                }
                if self.delete(tx, plan, true, BlobDisposal::Immediate)?.is_none() {
                    return Err(ArborError::Invalid("no space to undo insert").at_page(self.page_id()));
                }
            }
            PageOperation::LeafDelete { nodes } => {
                for (id, value) in nodes {
                    if self.navigate_to(id, SearchMode::ToInsertPos)? != NavigationStatus::Found {
                        return Err(ArborError::Invalid("deleted node is present again").at_page(self.page_id()));
                    }
                    if !self.insert_stored(tx, id, value, true)? {
                        return Err(ArborError::Invalid("no space to undo delete").at_page(self.page_id()));
                    }
                }
            }
            PageOperation::LeafUpdate { id, before, .. } => {
                self.position_on(id)?;
                let superseded = self
                    .set_stored(tx, before, true)?
                    .ok_or_else(|| ArborError::Invalid("no space to undo update").at_page(self.page_id()))?;
                if let OwnedValue::External(blob) = superseded {
                    if before.external() != Some(blob) {
                        self.core.dispose(&[blob], &mut BlobDisposal::Immediate)?;
                    }
                }
            }
            _ => return Err(ArborError::Invalid("record cannot be undone on a leaf")),
        }
        Ok(())
    }

    fn position_on(&mut self, id: &DeweyId) -> Result<()> {
        match self.navigate_to(id, SearchMode::ToKey)? {
            NavigationStatus::Found => Ok(()),
            _ => Err(ArborError::NotFound.at_page(self.page_id())),
        }
    }
}

/// Nodes of `before` missing from `after`; both are in document order.
fn removed_nodes(before: Vec<(DeweyId, OwnedValue)>, after: &[(DeweyId, OwnedValue)]) -> Vec<(DeweyId, OwnedValue)> {
    let mut kept = after.iter().peekable();
    let mut removed = Vec::new();
    for (id, value) in before {
        if kept.peek().map_or(false, |(k, _)| *k == id) {
            kept.next();
        } else {
            removed.push((id, value));
        }
    }
    removed
}

impl LatchedContext for LeafContext {
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

impl std::fmt::Debug for LeafContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafContext")
            .field("page", &self.core.page_id())
            .field("cursor", &self.cursor)
            .finish()
    }
}
