//! Subtree deletion and splitting of bracket leaves.
//!
//! Deletion is two-phase: `delete_prepare` walks the subtree, reports every
//! node to a visitor and returns a plan without touching the page; `delete`
//! applies the plan. Both phases rebuild the key area around the removed
//! range so the follower is re-encoded against the surviving predecessor.

use crate::storage::bracket::key::{generate_keys, KEY_LEN};
use crate::storage::bracket::page::{BracketLeaf, LeafCursor, NodeSlot, LEAF_HEADER_LEN};
use crate::storage::bracket::sequence::{NodeSequence, VALUE_REF_LEN};
use crate::storage::bracket::value::StoredValue;
use crate::types::checksum::crc32_of;
use crate::types::{ArborError, DeweyId, PageId, Result};

/// Reported to the delete visitor during the dry run.
#[derive(Debug)]
pub enum DeleteEvent<'a> {
    /// A node that will be removed, with its stored value.
    Node {
        /// Identifier of the node.
        id: &'a DeweyId,
        /// Value as stored in the page.
        value: StoredValue<'a>,
    },
    /// Emitted once after the last visited node.
    SubtreeEnd {
        /// Root of the deleted subtree.
        root: &'a DeweyId,
        /// Nodes visited on this page.
        nodes: usize,
        /// True when the subtree continues on the right neighbour.
        continues: bool,
    },
}

/// Byte range and bookkeeping of a prepared deletion.
#[derive(Clone, Debug)]
pub struct DeletePlan {
    root: DeweyId,
    start: usize,
    previous: Option<DeweyId>,
    follower: Option<(NodeSlot, DeweyId)>,
    nodes: usize,
    externals: Vec<PageId>,
    empties_page: bool,
    continues: bool,
    fingerprint: u32,
}

impl DeletePlan {
    /// Root of the deleted subtree.
    pub fn root(&self) -> &DeweyId {
        &self.root
    }

    /// Nodes the plan removes from this page.
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Blobs referenced by the removed nodes.
    pub fn externals(&self) -> &[PageId] {
        &self.externals
    }

    /// True when applying the plan would leave the page without nodes.
    pub fn empties_page(&self) -> bool {
        self.empties_page
    }

    /// True when the subtree extends past the page end.
    pub fn continues_on_next_page(&self) -> bool {
        self.continues
    }

    /// First surviving node after the removed range.
    pub fn follower(&self) -> Option<&DeweyId> {
        self.follower.as_ref().map(|(_, id)| id)
    }
}

/// Result of applying a plan.
#[derive(Clone, Debug)]
pub struct DeleteOutcome {
    /// Nodes removed.
    pub removed: usize,
    /// Blobs the removed nodes referenced.
    pub externals: Vec<PageId>,
    /// On the follower, or `AfterLast` when the removed range ended the page.
    pub cursor: LeafCursor,
}

/// Result of [`BracketLeaf::delete`].
#[derive(Clone, Debug)]
pub enum DeleteApplied {
    /// The plan was applied.
    Deleted(DeleteOutcome),
    /// The re-encoded follower (a promoted low key) does not fit; the page
    /// is unchanged. Split or unchain before retrying.
    NoSpace,
}

/// How the leading part of a page relates to a subtree begun on an earlier page.
#[derive(Clone, Debug)]
pub enum SubtreeRemainder {
    /// The page does not start inside the subtree.
    Untouched,
    /// A leading part of the page belongs to the subtree.
    Delete(DeletePlan),
    /// The whole page belongs to the subtree.
    DropPage(DeletePlan),
}

/// Where a split cuts.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SplitPoint {
    /// First node at which the bytes before it reach the given share of the
    /// used space.
    Occupancy(f64),
    /// Directly after the given node.
    After(NodeSlot),
}

/// Result of a split.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SplitOutcome {
    /// First identifier of the destination; new high key of the source.
    pub separator: DeweyId,
    /// Nodes left in the source.
    pub kept: usize,
    /// Nodes moved to the destination.
    pub moved: usize,
    /// The moved nodes as written into the destination.
    pub sequence: NodeSequence,
}

impl<B: AsRef<[u8]>> BracketLeaf<B> {
    /// Walks the subtree rooted at the current node without mutating.
    pub fn delete_prepare<F>(&self, cursor: &LeafCursor, mut visitor: F) -> Result<DeletePlan>
    where
        F: FnMut(DeleteEvent<'_>) -> Result<()>,
    {
        let (slot, id) = cursor.current()?;
        let previous = if slot.is_low() {
            None
        } else {
            Some(self.node_before(slot)?)
        };
        self.plan_subtree(slot, id, previous, id, &mut visitor)
    }

    /// Prepares removing the leading nodes that belong to `root`'s subtree,
    /// which started on an earlier page.
    pub fn delete_remaining_subtree<F>(&self, root: &DeweyId, mut visitor: F) -> Result<SubtreeRemainder>
    where
        F: FnMut(DeleteEvent<'_>) -> Result<()>,
    {
        let Some((scan, first)) = self.scan()? else {
            return Ok(SubtreeRemainder::Untouched);
        };
        let low = scan.buffer().to_id()?;
        if !root.is_ancestor_of(&low) {
            return Ok(SubtreeRemainder::Untouched);
        }
        let plan = self.plan_subtree(first, &low, None, root, &mut visitor)?;
        Ok(if plan.empties_page {
            SubtreeRemainder::DropPage(plan)
        } else {
            SubtreeRemainder::Delete(plan)
        })
    }

    fn node_before(&self, target: NodeSlot) -> Result<DeweyId> {
        let (mut scan, first) = self
            .scan()?
            .ok_or(ArborError::Invalid("cursor does not point into this page"))?;
        let mut previous = scan.buffer().to_id()?;
        let mut at = first;
        loop {
            if at == target {
                return Err(ArborError::Invalid("cursor does not point into this page"));
            }
            match scan.next_node()? {
                Some(next) if next == target => return Ok(previous),
                Some(next) => {
                    at = next;
                    previous = scan.buffer().to_id()?;
                }
                None => return Err(ArborError::Invalid("cursor does not point into this page")),
            }
        }
    }

    fn plan_subtree(
        &self,
        start: NodeSlot,
        start_id: &DeweyId,
        previous: Option<DeweyId>,
        root: &DeweyId,
        visitor: &mut dyn FnMut(DeleteEvent<'_>) -> Result<()>,
    ) -> Result<DeletePlan> {
        let mut externals = Vec::new();
        let value = self.value_at(start)?;
        externals.extend(value.external());
        visitor(DeleteEvent::Node { id: start_id, value })?;
        let mut nodes = 1usize;
        let mut follower = None;
        let mut scan = self.scan_after(start, start_id);
        while let Some(slot) = scan.next_node()? {
            let id = scan.buffer().to_id()?;
            if !scan.buffer().is_within(root) {
                follower = Some((slot, id));
                break;
            }
            let value = self.value_at(slot)?;
            externals.extend(value.external());
            visitor(DeleteEvent::Node { id: &id, value })?;
            nodes += 1;
        }
        let continues = follower.is_none()
            && self
                .high_key()?
                .map_or(false, |high| root.is_ancestor_of(&high));
        visitor(DeleteEvent::SubtreeEnd {
            root,
            nodes,
            continues,
        })?;
        Ok(DeletePlan {
            root: root.clone(),
            start: start.chain_start,
            previous,
            empties_page: start.is_low() && follower.is_none(),
            follower,
            nodes,
            externals,
            continues,
            fingerprint: self.fingerprint(),
        })
    }

    /// Checksum of the leaf payload; any change after the dry run shows up.
    fn fingerprint(&self) -> u32 {
        crc32_of(&[self.payload()])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BracketLeaf<B> {
    /// Applies a prepared deletion. A plan that would empty the page is
    /// refused with [`ArborError::EmptyLeaf`] so the caller can unchain it.
    /// A plan prepared against other page contents is rejected.
    pub fn delete(&mut self, plan: DeletePlan) -> Result<DeleteApplied> {
        if plan.fingerprint != self.fingerprint() {
            return Err(ArborError::Invalid("delete plan prepared against another page state"));
        }
        if plan.empties_page {
            return Err(ArborError::EmptyLeaf(self.page_id()?));
        }
        let records = self.record_count() - plan.nodes;
        let payload = self.payload();
        let cursor = match &plan.follower {
            None => {
                let keys = payload[LEAF_HEADER_LEN..plan.start].to_vec();
                let low = self.low_key()?;
                if !self.relayout(keys, low.as_ref(), records)? {
                    return Ok(DeleteApplied::NoSpace);
                }
                LeafCursor::after_last()
            }
            Some((slot, id)) => {
                let tail = &payload[slot.entry + KEY_LEN..self.key_end()];
                match &plan.previous {
                    Some(previous) => {
                        let mut keys = payload[LEAF_HEADER_LEN..plan.start].to_vec();
                        for key in generate_keys(previous, id)? {
                            keys.extend_from_slice(&key.encode());
                        }
                        let entry = LEAF_HEADER_LEN + keys.len() - KEY_LEN;
                        keys.extend_from_slice(tail);
                        let low = self.low_key()?;
                        if !self.relayout(keys, low.as_ref(), records)? {
                            return Ok(DeleteApplied::NoSpace);
                        }
                        LeafCursor::at(
                            NodeSlot {
                                chain_start: plan.start,
                                entry,
                                end: entry + KEY_LEN + VALUE_REF_LEN,
                            },
                            id.clone(),
                        )
                    }
                    None => {
                        let mut keys = id.to_bytes();
                        let low_len = keys.len();
                        keys.extend_from_slice(tail);
                        if !self.relayout(keys, Some(id), records)? {
                            return Ok(DeleteApplied::NoSpace);
                        }
                        LeafCursor::at(NodeSlot::low(low_len), id.clone())
                    }
                }
            }
        };
        Ok(DeleteApplied::Deleted(DeleteOutcome {
            removed: plan.nodes,
            externals: plan.externals,
            cursor,
        }))
    }

    /// Moves the upper part of this leaf into the empty leaf `dst`. The
    /// source high key becomes the separator and `dst` inherits the old
    /// source high key. Page links are left to the caller.
    pub fn split_into<D>(&mut self, dst: &mut BracketLeaf<D>, point: SplitPoint) -> Result<SplitOutcome>
    where
        D: AsRef<[u8]> + AsMut<[u8]>,
    {
        if !dst.is_empty() {
            return Err(ArborError::Invalid("split destination must be empty"));
        }
        let mut nodes = Vec::with_capacity(self.record_count());
        if let Some((mut scan, first)) = self.scan()? {
            let mut slot = Some(first);
            while let Some(current) = slot {
                let (_, value_len) = self.value_field_len(current.ref_offset())?;
                let cost = current.end - current.chain_start + value_len;
                nodes.push((current, scan.buffer().to_id()?, cost));
                slot = scan.next_node()?;
            }
        }
        let n = nodes.len();
        if n < 2 {
            return Err(ArborError::Invalid("cannot split a leaf with fewer than two nodes"));
        }
        let by_occupancy = |share: f64| {
            let total: usize = nodes.iter().map(|(_, _, cost)| cost).sum();
            let threshold = share.clamp(0.0, 1.0) * total as f64;
            let mut acc = 0usize;
            let mut cut = n - 1;
            for idx in 1..n {
                acc += nodes[idx - 1].2;
                if acc as f64 >= threshold {
                    cut = idx;
                    break;
                }
            }
            cut
        };
        let cut = match point {
            SplitPoint::Occupancy(share) => by_occupancy(share),
            SplitPoint::After(slot) => match nodes.iter().position(|(s, _, _)| *s == slot) {
                Some(idx) if idx + 1 < n => idx + 1,
                Some(_) => by_occupancy(0.5),
                None => return Err(ArborError::Invalid("split position does not point into this page")),
            },
        };
        let (cut_slot, separator, _) = nodes[cut].clone();
        let seq = self.extract_sequence(cut_slot, &separator)?;
        let old_high = self.high_key()?;
        let inherited = old_high.as_ref().map_or(0, DeweyId::encoded_len);
        if seq.page_len() + inherited > dst.free_space() {
            return Err(ArborError::Invalid("split tail does not fit the destination page"));
        }
        let moved_bytes: usize = nodes[cut..].iter().map(|(_, _, cost)| cost).sum();
        let growth = separator.encoded_len().saturating_sub(inherited);
        if growth > self.free_space() + moved_bytes {
            return Err(ArborError::Invalid("separator does not fit the source page"));
        }
        if !dst.set_high_key(old_high.as_ref())? || !dst.append_sequence(&seq)? {
            return Err(ArborError::Invalid("split tail does not fit the destination page"));
        }
        self.truncate_from(cut_slot, n - cut)?;
        if !self.set_high_key(Some(&separator))? {
            return Err(ArborError::Corruption("separator lost space during split"));
        }
        Ok(SplitOutcome {
            separator,
            kept: cut,
            moved: n - cut,
            sequence: seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::bracket::navigation::{NavigationStatus, SearchMode};
    use crate::storage::bracket::page::tests::{fill, id, ids, leaf};

    fn cursor_on(leaf: &BracketLeaf<Vec<u8>>, text: &str) -> Result<LeafCursor> {
        let mut cursor = LeafCursor::before_first();
        assert_eq!(
            leaf.navigate_context_free(&mut cursor, &id(text), SearchMode::ToKey)?,
            NavigationStatus::Found
        );
        Ok(cursor)
    }

    fn deleted(applied: DeleteApplied) -> DeleteOutcome {
        match applied {
            DeleteApplied::Deleted(outcome) => outcome,
            DeleteApplied::NoSpace => panic!("delete ran out of space"),
        }
    }

    const TREE: &[&str] = &["0/0:1", "0/0:1.3", "0/0:1.3.1.3", "0/0:1.3.3", "0/0:1.3.3.3", "0/0:1.5", "0/0:1.7"];

    #[test]
    fn prepare_visits_subtree_without_mutating() -> Result<()> {
        let mut leaf = leaf(1024);
        fill(&mut leaf, TREE)?;
        let before = leaf.as_bytes().to_vec();
        let cursor = cursor_on(&leaf, "0/0:1.3")?;
        let mut visited = Vec::new();
        let mut ends = 0;
        let plan = leaf.delete_prepare(&cursor, |event| {
            match event {
                DeleteEvent::Node { id, .. } => visited.push(id.to_string()),
                DeleteEvent::SubtreeEnd { nodes, continues, .. } => {
                    ends += 1;
                    assert_eq!(nodes, 4);
                    assert!(!continues);
                }
            }
            Ok(())
        })?;
        assert_eq!(visited, vec!["0/0:1.3", "0/0:1.3.1.3", "0/0:1.3.3", "0/0:1.3.3.3"]);
        assert_eq!(ends, 1);
        assert_eq!(plan.follower(), Some(&id("0/0:1.5")));
        assert_eq!(leaf.as_bytes(), &before[..]);

        let outcome = deleted(leaf.delete(plan)?);
        assert_eq!(outcome.removed, 4);
        assert_eq!(outcome.cursor.id(), Some(&id("0/0:1.5")));
        assert_eq!(ids(&leaf)?, vec!["0/0:1", "0/0:1.5", "0/0:1.7"]);
        assert_eq!(leaf.value(&outcome.cursor)?, StoredValue::Inline(&b"0/0:1.5"[..]));
        leaf.check()?;
        Ok(())
    }

    #[test]
    fn deleting_low_key_promotes_follower() -> Result<()> {
        let mut leaf = leaf(1024);
        fill(&mut leaf, &["0/0:1.3", "0/0:1.3.3", "0/0:1.5", "0/0:1.7"])?;
        let cursor = cursor_on(&leaf, "0/0:1.3")?;
        let plan = leaf.delete_prepare(&cursor, |_| Ok(()))?;
        let outcome = deleted(leaf.delete(plan)?);
        assert_eq!(leaf.low_key()?, Some(id("0/0:1.5")));
        assert_eq!(outcome.cursor.id(), Some(&id("0/0:1.5")));
        assert_eq!(ids(&leaf)?, vec!["0/0:1.5", "0/0:1.7"]);
        leaf.check()?;
        Ok(())
    }

    #[test]
    fn deleting_the_tail_and_the_whole_page() -> Result<()> {
        let mut leaf = leaf(1024);
        fill(&mut leaf, &["0/0:1", "0/0:1.3", "0/0:1.3.3"])?;
        let cursor = cursor_on(&leaf, "0/0:1.3")?;
        let outcome = deleted(leaf.delete(leaf.delete_prepare(&cursor, |_| Ok(()))?)?);
        assert_eq!(outcome.cursor, LeafCursor::after_last());
        assert_eq!(ids(&leaf)?, vec!["0/0:1"]);
        leaf.check()?;

        let cursor = cursor_on(&leaf, "0/0:1")?;
        let plan = leaf.delete_prepare(&cursor, |_| Ok(()))?;
        assert!(plan.empties_page());
        assert!(matches!(leaf.delete(plan), Err(ArborError::EmptyLeaf(PageId(7)))));
        assert_eq!(ids(&leaf)?, vec!["0/0:1"]);
        Ok(())
    }

    #[test]
    fn stale_plan_is_rejected() -> Result<()> {
        let mut leaf = leaf(1024);
        fill(&mut leaf, &["0/0:1", "0/0:1.3", "0/0:1.5"])?;
        let plan = leaf.delete_prepare(&cursor_on(&leaf, "0/0:1.3")?, |_| Ok(()))?;
        let other = leaf.delete_prepare(&cursor_on(&leaf, "0/0:1.5")?, |_| Ok(()))?;
        deleted(leaf.delete(other)?);
        assert!(matches!(leaf.delete(plan), Err(ArborError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn plan_is_stale_after_same_size_value_change() -> Result<()> {
        let mut leaf = leaf(1024);
        fill(&mut leaf, &["0/0:1", "0/0:1.3", "0/0:1.5"])?;
        leaf.set_value(&cursor_on(&leaf, "0/0:1.3")?, StoredValue::External(PageId(100)))?;
        let plan = leaf.delete_prepare(&cursor_on(&leaf, "0/0:1.3")?, |_| Ok(()))?;
        assert_eq!(plan.externals(), &[PageId(100)]);

        leaf.set_value(&cursor_on(&leaf, "0/0:1.3")?, StoredValue::External(PageId(200)))?;
        assert!(matches!(leaf.delete(plan), Err(ArborError::Invalid(_))));
        assert_eq!(ids(&leaf)?, vec!["0/0:1", "0/0:1.3", "0/0:1.5"]);

        let plan = leaf.delete_prepare(&cursor_on(&leaf, "0/0:1.3")?, |_| Ok(()))?;
        assert_eq!(deleted(leaf.delete(plan)?).externals, vec![PageId(200)]);
        Ok(())
    }

    #[test]
    fn visitor_errors_abort_prepare() -> Result<()> {
        let mut leaf = leaf(1024);
        fill(&mut leaf, &["0/0:1", "0/0:1.3"])?;
        let err = leaf
            .delete_prepare(&cursor_on(&leaf, "0/0:1")?, |_| Err(ArborError::NotFound))
            .unwrap_err();
        assert!(matches!(err, ArborError::NotFound));
        Ok(())
    }

    #[test]
    fn remaining_subtree_on_following_page() -> Result<()> {
        let root = id("0/0:1.3");
        let mut leaf = leaf(1024);
        fill(&mut leaf, &["0/0:1.3.5", "0/0:1.3.5.3", "0/0:1.3.7", "0/0:1.5"])?;
        let mut seen = 0;
        let remainder = leaf.delete_remaining_subtree(&root, |event| {
            if let DeleteEvent::Node { .. } = event {
                seen += 1;
            }
            Ok(())
        })?;
        let SubtreeRemainder::Delete(plan) = remainder else {
            panic!("expected a partial delete");
        };
        assert_eq!(seen, 3);
        deleted(leaf.delete(plan)?);
        assert_eq!(ids(&leaf)?, vec!["0/0:1.5"]);
        leaf.check()?;

        assert!(matches!(
            leaf.delete_remaining_subtree(&root, |_| Ok(()))?,
            SubtreeRemainder::Untouched
        ));

        let mut whole = crate::storage::bracket::page::tests::leaf(1024);
        fill(&mut whole, &["0/0:1.3.9", "0/0:1.3.11"])?;
        whole.set_high_key(Some(&id("0/0:1.3.13")))?;
        match whole.delete_remaining_subtree(&root, |_| Ok(()))? {
            SubtreeRemainder::DropPage(plan) => {
                assert!(plan.continues_on_next_page());
                assert_eq!(plan.nodes(), 2);
            }
            other => panic!("expected DropPage, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn split_moves_tail_and_sets_high_keys() -> Result<()> {
        let mut src = leaf(1024);
        fill(&mut src, TREE)?;
        src.set_high_key(Some(&id("0/0:1.9")))?;
        let original = ids(&src)?;
        let mut dst = leaf(1024);
        let outcome = src.split_into(&mut dst, SplitPoint::Occupancy(0.5))?;
        assert_eq!(outcome.kept + outcome.moved, TREE.len());
        assert!(outcome.kept >= 1 && outcome.moved >= 1);
        assert_eq!(src.high_key()?, Some(outcome.separator.clone()));
        assert_eq!(dst.high_key()?, Some(id("0/0:1.9")));
        assert_eq!(dst.low_key()?, Some(outcome.separator.clone()));
        let mut joined = ids(&src)?;
        joined.extend(ids(&dst)?);
        assert_eq!(joined, original);
        src.check()?;
        dst.check()?;
        Ok(())
    }

    #[test]
    fn split_after_current_and_fallback() -> Result<()> {
        let mut src = leaf(1024);
        fill(&mut src, TREE)?;
        let cursor = cursor_on(&src, "0/0:1.3.1.3")?;
        let mut dst = leaf(1024);
        let outcome = src.split_into(&mut dst, SplitPoint::After(cursor.slot().unwrap()))?;
        assert_eq!(outcome.separator, id("0/0:1.3.3"));
        assert_eq!(outcome.kept, 3);

        let mut src = leaf(1024);
        fill(&mut src, TREE)?;
        let last = src.last_node()?.unwrap().0;
        let mut dst = leaf(1024);
        let outcome = src.split_into(&mut dst, SplitPoint::After(last))?;
        assert!(outcome.kept >= 1 && outcome.moved >= 1);

        let mut single = leaf(1024);
        fill(&mut single, &["0/0:1"])?;
        let mut dst = leaf(1024);
        assert!(single.split_into(&mut dst, SplitPoint::Occupancy(0.5)).is_err());
        Ok(())
    }
}
