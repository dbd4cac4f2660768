//! Cursor movement and structural navigation inside one leaf.
//!
//! Identifiers can only be rebuilt by replaying keys forward, so backward
//! moves rescan from the low key. Structural modes answer `PossiblyFound`
//! when the high key shows that the wanted node may live on a neighbour.

use std::cmp::Ordering;

use crate::storage::bracket::page::{BracketLeaf, LeafCursor, NodeSlot, Position};
use crate::types::{ArborError, DeweyId, Result};

/// Structural navigation relative to the current node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NavigationMode {
    /// Owning element of the current node.
    Parent,
    /// First non-attribute child.
    FirstChild,
    /// Last non-attribute child.
    LastChild,
    /// Following node with the same parent and kind.
    NextSibling,
    /// Preceding node with the same parent and kind.
    PreviousSibling,
    /// Next attribute of the current element (or of the current attribute's owner).
    NextAttribute,
}

/// Navigation to a key, starting from the low key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SearchMode {
    /// Position on the node equal to the key.
    ToKey,
    /// Position on the greatest node below the key (or in front of the page).
    ToInsertPos,
}

/// Outcome of a navigation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NavigationStatus {
    /// The cursor moved to the answer.
    Found,
    /// The answer may be on an adjacent page; the cursor is unchanged.
    PossiblyFound,
    /// No such node; the cursor is unchanged.
    NotFound,
}

impl<B: AsRef<[u8]>> BracketLeaf<B> {
    /// Moves to the low key.
    pub fn move_first(&self, cursor: &mut LeafCursor) -> Result<bool> {
        match self.scan()? {
            Some((scan, slot)) => {
                *cursor = LeafCursor::at(slot, scan.buffer().to_id()?);
                Ok(true)
            }
            None => {
                *cursor = LeafCursor::after_last();
                Ok(false)
            }
        }
    }

    /// Moves to the following node; past the last node the cursor ends
    /// `AfterLast` and false is returned.
    pub fn move_next(&self, cursor: &mut LeafCursor) -> Result<bool> {
        match cursor.position() {
            Position::BeforeFirst => self.move_first(cursor),
            Position::AfterLast => Ok(false),
            Position::At(_) => {
                let (slot, id) = cursor.current()?;
                match self.node_after(slot, id)? {
                    Some((next, next_id)) => {
                        *cursor = LeafCursor::at(next, next_id);
                        Ok(true)
                    }
                    None => {
                        *cursor = LeafCursor::after_last();
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Moves to the last node.
    pub fn move_last(&self, cursor: &mut LeafCursor) -> Result<bool> {
        match self.last_node()? {
            Some((slot, id)) => {
                *cursor = LeafCursor::at(slot, id);
                Ok(true)
            }
            None => {
                *cursor = LeafCursor::before_first();
                Ok(false)
            }
        }
    }

    /// Moves to the preceding node; in front of the low key the cursor ends
    /// `BeforeFirst` and false is returned.
    pub fn move_previous(&self, cursor: &mut LeafCursor) -> Result<bool> {
        let target = match cursor.position() {
            Position::BeforeFirst => return Ok(false),
            Position::AfterLast => return self.move_last(cursor),
            Position::At(slot) => slot,
        };
        let Some((mut scan, first)) = self.scan()? else {
            *cursor = LeafCursor::before_first();
            return Ok(false);
        };
        if first == target {
            *cursor = LeafCursor::before_first();
            return Ok(false);
        }
        let mut previous = (first, scan.buffer().to_id()?);
        while let Some(slot) = scan.next_node()? {
            if slot == target {
                *cursor = LeafCursor::at(previous.0, previous.1);
                return Ok(true);
            }
            previous = (slot, scan.buffer().to_id()?);
        }
        Err(ArborError::Invalid("cursor does not point into this page"))
    }

    /// Structural navigation from the current node.
    pub fn navigate(&self, cursor: &mut LeafCursor, mode: NavigationMode) -> Result<NavigationStatus> {
        let (slot, current) = cursor.current()?;
        let current = current.clone();
        let answer = match mode {
            NavigationMode::FirstChild => self.first_child(slot, &current)?,
            NavigationMode::LastChild => self.last_child(slot, &current)?,
            NavigationMode::NextSibling if current.is_attribute() => {
                self.next_attribute(slot, &current)?
            }
            NavigationMode::NextSibling => self.next_sibling(slot, &current)?,
            NavigationMode::PreviousSibling => self.previous_sibling(slot, &current)?,
            NavigationMode::Parent => self.parent(slot, &current)?,
            NavigationMode::NextAttribute => self.next_attribute(slot, &current)?,
        };
        Ok(settle(cursor, answer))
    }

    /// Navigation to `key` starting from the low key.
    pub fn navigate_context_free(
        &self,
        cursor: &mut LeafCursor,
        key: &DeweyId,
        mode: SearchMode,
    ) -> Result<NavigationStatus> {
        let high = self.high_key()?;
        if high.as_ref().map_or(false, |h| key >= h) {
            return Ok(NavigationStatus::PossiblyFound);
        }
        let Some((mut scan, first)) = self.scan()? else {
            return Ok(match mode {
                SearchMode::ToKey => NavigationStatus::NotFound,
                SearchMode::ToInsertPos => {
                    *cursor = LeafCursor::before_first();
                    NavigationStatus::Found
                }
            });
        };
        scan.buffer_mut().set_compare_target(key);
        let mut slot = first;
        let mut previous: Option<(NodeSlot, DeweyId)> = None;
        loop {
            match scan.buffer().compare_to_target() {
                Some(Ordering::Less) => {
                    if mode == SearchMode::ToInsertPos {
                        previous = Some((slot, scan.buffer().to_id()?));
                    }
                }
                Some(Ordering::Equal) => {
                    return Ok(match mode {
                        SearchMode::ToKey => {
                            *cursor = LeafCursor::at(slot, scan.buffer().to_id()?);
                            NavigationStatus::Found
                        }
                        SearchMode::ToInsertPos => NavigationStatus::NotFound,
                    });
                }
                _ => break,
            }
            match scan.next_node()? {
                Some(next) => slot = next,
                None => break,
            }
        }
        Ok(match mode {
            SearchMode::ToKey if slot == first && scan.buffer().cmp_id(key) == Ordering::Greater => {
                NavigationStatus::PossiblyFound
            }
            SearchMode::ToKey => NavigationStatus::NotFound,
            SearchMode::ToInsertPos => {
                *cursor = match previous {
                    Some((slot, id)) => LeafCursor::at(slot, id),
                    None => LeafCursor::before_first(),
                };
                NavigationStatus::Found
            }
        })
    }

    fn first_child(&self, slot: NodeSlot, current: &DeweyId) -> Result<Answer> {
        if current.is_attribute() {
            return Ok(Answer::NotFound);
        }
        let mut scan = self.scan_after(slot, current);
        while let Some(next) = scan.next_node()? {
            if !scan.buffer().is_within(current) {
                return Ok(Answer::NotFound);
            }
            let id = scan.buffer().to_id()?;
            if id.is_attribute() && current.is_parent_of(&id) {
                continue;
            }
            return Ok(if current.is_parent_of(&id) {
                Answer::Found(next, id)
            } else {
                Answer::NotFound
            });
        }
        self.past_page_end(|high| current.is_ancestor_of(high))
    }

    fn last_child(&self, slot: NodeSlot, current: &DeweyId) -> Result<Answer> {
        if current.is_attribute() {
            return Ok(Answer::NotFound);
        }
        let mut scan = self.scan_after(slot, current);
        let mut last = None;
        while let Some(next) = scan.next_node()? {
            if !scan.buffer().is_within(current) {
                return Ok(last.map_or(Answer::NotFound, |(s, id)| Answer::Found(s, id)));
            }
            let id = scan.buffer().to_id()?;
            if !id.is_attribute() && current.is_parent_of(&id) {
                last = Some((next, id));
            }
        }
        match self.past_page_end(|high| current.is_ancestor_of(high))? {
            Answer::PossiblyFound => Ok(Answer::PossiblyFound),
            _ => Ok(last.map_or(Answer::NotFound, |(s, id)| Answer::Found(s, id))),
        }
    }

    fn next_sibling(&self, slot: NodeSlot, current: &DeweyId) -> Result<Answer> {
        let Some(parent) = current.parent() else {
            return Ok(Answer::NotFound);
        };
        let mut scan = self.scan_after(slot, current);
        while let Some(next) = scan.next_node()? {
            if scan.buffer().is_within(current) {
                continue;
            }
            let id = scan.buffer().to_id()?;
            return Ok(if current.is_sibling_of(&id) {
                Answer::Found(next, id)
            } else {
                Answer::NotFound
            });
        }
        self.past_page_end(|high| parent.is_ancestor_of(high) && !high.is_attribute())
    }

    fn next_attribute(&self, slot: NodeSlot, current: &DeweyId) -> Result<Answer> {
        let owner = if current.is_attribute() {
            match current.parent() {
                Some(owner) => owner,
                None => return Ok(Answer::NotFound),
            }
        } else {
            current.clone()
        };
        let is_attribute_of_owner = |id: &DeweyId| id.is_attribute() && owner.is_parent_of(id);
        match self.node_after(slot, current)? {
            Some((next, id)) if is_attribute_of_owner(&id) => Ok(Answer::Found(next, id)),
            Some(_) => Ok(Answer::NotFound),
            None => self.past_page_end(|high| is_attribute_of_owner(high)),
        }
    }

    fn previous_sibling(&self, slot: NodeSlot, current: &DeweyId) -> Result<Answer> {
        let Some(parent) = current.parent() else {
            return Ok(Answer::NotFound);
        };
        let Some((mut scan, first)) = self.scan()? else {
            return Ok(Answer::NotFound);
        };
        let mut sibling = None;
        let mut parent_seen = false;
        let mut at = first;
        while at != slot {
            if scan.buffer().matches(&parent) {
                parent_seen = true;
            } else {
                let id = scan.buffer().to_id()?;
                if id.is_sibling_of(current) {
                    sibling = Some((at, id));
                }
            }
            at = match scan.next_node()? {
                Some(next) => next,
                None => return Err(ArborError::Invalid("cursor does not point into this page")),
            };
        }
        Ok(match sibling {
            Some((s, id)) => Answer::Found(s, id),
            None if parent_seen => Answer::NotFound,
            None => Answer::PossiblyFound,
        })
    }

    fn parent(&self, slot: NodeSlot, current: &DeweyId) -> Result<Answer> {
        let Some(parent) = current.parent() else {
            return Ok(Answer::NotFound);
        };
        let Some((mut scan, first)) = self.scan()? else {
            return Ok(Answer::NotFound);
        };
        if scan.buffer().cmp_id(&parent) == Ordering::Greater {
            return Ok(Answer::PossiblyFound);
        }
        let mut at = first;
        while at != slot {
            if scan.buffer().matches(&parent) {
                return Ok(Answer::Found(at, parent));
            }
            at = match scan.next_node()? {
                Some(next) => next,
                None => break,
            };
        }
        Ok(Answer::NotFound)
    }

    fn past_page_end(&self, continues: impl Fn(&DeweyId) -> bool) -> Result<Answer> {
        Ok(match self.high_key()? {
            Some(high) if continues(&high) => Answer::PossiblyFound,
            _ => Answer::NotFound,
        })
    }
}

enum Answer {
    Found(NodeSlot, DeweyId),
    PossiblyFound,
    NotFound,
}

fn settle(cursor: &mut LeafCursor, answer: Answer) -> NavigationStatus {
    match answer {
        Answer::Found(slot, id) => {
            *cursor = LeafCursor::at(slot, id);
            NavigationStatus::Found
        }
        Answer::PossiblyFound => NavigationStatus::PossiblyFound,
        Answer::NotFound => NavigationStatus::NotFound,
    }
}
