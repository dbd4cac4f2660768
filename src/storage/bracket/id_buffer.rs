//! Mutable identifier rebuilt while replaying bracket keys.

use std::cmp::Ordering;

use crate::storage::bracket::key::{next_odd, BracketKey, KeyType};
use crate::types::dewey::{attribute_marker, strip_to_parent, Divisions, ATTRIBUTE_MARKER};
use crate::types::{ArborError, DeweyId, DocId, Result};

#[derive(Clone, Debug)]
struct CompareState {
    target: DeweyId,
    prefix: usize,
    ordering: Ordering,
}

/// Division array advanced key by key during forward scans.
///
/// In compare mode the buffer tracks the common prefix with a target
/// identifier so that each update only re-examines the divisions it touched.
#[derive(Clone, Debug)]
pub struct DeweyIdBuffer {
    doc: DocId,
    divisions: Divisions,
    marker: Option<usize>,
    odd: usize,
    compare: Option<CompareState>,
}

impl DeweyIdBuffer {
    /// Empty buffer positioned in `doc`.
    pub fn new(doc: DocId) -> Self {
        Self {
            doc,
            divisions: Divisions::new(),
            marker: None,
            odd: 0,
            compare: None,
        }
    }

    /// Buffer holding `id`.
    pub fn from_id(id: &DeweyId) -> Self {
        let mut buffer = Self::new(id.doc());
        buffer.set(id);
        buffer
    }

    /// Replaces the contents with `id`.
    pub fn set(&mut self, id: &DeweyId) {
        self.doc = id.doc();
        self.divisions.clear();
        self.divisions.extend_from_slice(id.divisions());
        self.recount();
        self.refresh_compare(0);
    }

    /// Document of the current position.
    pub fn doc(&self) -> DocId {
        self.doc
    }

    /// Current division path.
    pub fn divisions(&self) -> &[u32] {
        &self.divisions
    }

    /// True before the first key of a document has been applied.
    pub fn is_empty(&self) -> bool {
        self.divisions.is_empty()
    }

    /// Level of the current position.
    pub fn level(&self) -> usize {
        self.odd - usize::from(self.marker.is_some())
    }

    /// True while positioned on an attribute.
    pub fn is_attribute(&self) -> bool {
        self.marker.is_some()
    }

    /// Materializes the current position.
    pub fn to_id(&self) -> Result<DeweyId> {
        DeweyId::new(self.doc, &self.divisions)
            .map_err(|_| ArborError::Corruption("bracket keys replay to a malformed identifier"))
    }

    /// True if the current position equals `id`.
    pub fn matches(&self, id: &DeweyId) -> bool {
        self.doc == id.doc() && self.divisions.as_slice() == id.divisions()
    }

    /// Orders the current position against `id`.
    pub fn cmp_id(&self, id: &DeweyId) -> Ordering {
        self.doc
            .cmp(&id.doc())
            .then_with(|| self.divisions.as_slice().cmp(id.divisions()))
    }

    /// True if the current position is `root` or lies in its subtree.
    pub fn is_within(&self, root: &DeweyId) -> bool {
        self.doc == root.doc() && self.divisions.starts_with(root.divisions())
    }

    /// Applies one key.
    pub fn update(&mut self, key: BracketKey) -> Result<()> {
        if key.kind() == KeyType::Document {
            self.doc.number = self
                .doc
                .number
                .checked_add(key.document_gap())
                .ok_or(ArborError::Corruption("document number overflow"))?;
            self.divisions.clear();
            self.marker = None;
            self.odd = 0;
            self.refresh_compare(0);
            return Ok(());
        }
        let closing = key.closing_brackets() as usize;
        let skip = 2 * key.id_gaps();
        let changed_from = if closing == 0 {
            let at = self.divisions.len();
            if key.kind() == KeyType::Attribute && self.marker.is_none() && at > 0 {
                self.push(ATTRIBUTE_MARKER);
                self.marker = Some(at);
            }
            let fresh: u32 = if self.divisions.is_empty() { 1 } else { 3 };
            let mut value = fresh + skip;
            if key.kind() == KeyType::Overflow {
                value -= 1;
            }
            self.push(value);
            at
        } else {
            let len = self.divisions.len();
            if closing > len {
                return Err(ArborError::Corruption("bracket key closes more divisions than open"));
            }
            self.truncate(len - (closing - 1));
            let last_idx = self.divisions.len() - 1;
            if self.marker == Some(last_idx) {
                self.marker = None;
            }
            let last = self.divisions[last_idx];
            let mut value = next_odd(last)
                .and_then(|v| v.checked_add(skip))
                .ok_or(ArborError::Corruption("division overflow during replay"))?;
            if key.kind() == KeyType::Overflow {
                value -= 1;
            }
            self.replace_last(value);
            if key.kind() == KeyType::Attribute && self.marker.is_none() {
                self.divisions.insert(last_idx, ATTRIBUTE_MARKER);
                self.odd += 1;
                self.marker = Some(last_idx);
            }
            last_idx
        };
        self.refresh_compare(changed_from);
        Ok(())
    }

    /// Moves to the parent node. Returns false at the document root.
    pub fn set_to_parent(&mut self) -> bool {
        if !strip_to_parent(&mut self.divisions) {
            return false;
        }
        let len = self.divisions.len();
        self.recount();
        self.refresh_compare(len);
        true
    }

    /// Enters compare mode against `target`.
    pub fn set_compare_target(&mut self, target: &DeweyId) {
        self.compare = Some(CompareState {
            target: target.clone(),
            prefix: 0,
            ordering: Ordering::Equal,
        });
        self.refresh_compare(0);
    }

    /// Leaves compare mode.
    pub fn clear_compare_target(&mut self) {
        self.compare = None;
    }

    /// Ordering of the current position against the compare target.
    pub fn compare_to_target(&self) -> Option<Ordering> {
        self.compare.as_ref().map(|state| state.ordering)
    }

    /// Common division prefix with the compare target.
    pub fn target_prefix_len(&self) -> Option<usize> {
        self.compare.as_ref().map(|state| state.prefix)
    }

    fn push(&mut self, value: u32) {
        self.odd += (value % 2) as usize;
        self.divisions.push(value);
    }

    fn truncate(&mut self, len: usize) {
        while self.divisions.len() > len {
            if let Some(value) = self.divisions.pop() {
                self.odd -= (value % 2) as usize;
            }
        }
        if self.marker.map_or(false, |m| m >= len) {
            self.marker = None;
        }
    }

    fn replace_last(&mut self, value: u32) {
        if let Some(slot) = self.divisions.last_mut() {
            self.odd -= (*slot % 2) as usize;
            *slot = value;
            self.odd += (value % 2) as usize;
        }
    }

    fn recount(&mut self) {
        self.odd = self.divisions.iter().filter(|&&d| d % 2 == 1).count();
        self.marker = attribute_marker(&self.divisions);
    }

    fn refresh_compare(&mut self, changed_from: usize) {
        let Some(state) = self.compare.as_mut() else {
            return;
        };
        let target = state.target.divisions();
        if self.doc != state.target.doc() {
            state.prefix = 0;
            state.ordering = self.doc.cmp(&state.target.doc());
            return;
        }
        let mut prefix = state.prefix.min(changed_from).min(self.divisions.len());
        while prefix < self.divisions.len()
            && prefix < target.len()
            && self.divisions[prefix] == target[prefix]
        {
            prefix += 1;
        }
        state.prefix = prefix;
        state.ordering = match (self.divisions.get(prefix), target.get(prefix)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        };
    }
}
