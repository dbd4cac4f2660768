//! Hierarchical node identifiers.
//!
//! A [`DeweyId`] names a node by its document and the path of divisions from
//! the document root. Odd divisions are sibling positions, even divisions
//! are overflow steps that open room between two neighbours. A division `1`
//! after the root marks the attribute region of the preceding element and is
//! followed by exactly one more division naming the attribute.

use std::cmp::Ordering;
use std::fmt;

use smallvec::SmallVec;

use crate::primitives::bytes::{buf::Reader, ord};
use crate::types::{ArborError, Result};

/// Division of the document root node.
pub const ROOT_DIVISION: u32 = 1;
/// Division that opens the attribute region of an element.
pub const ATTRIBUTE_MARKER: u32 = 1;
/// Division of the first child (or attribute) allocated under a node.
pub const FIRST_CHILD_DIVISION: u32 = 3;

/// Inline storage for identifier paths; most documents are shallower than this.
pub type Divisions = SmallVec<[u32; 8]>;

/// Document address within a collection.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DocId {
    /// Collection the document belongs to.
    pub collection: u32,
    /// Document number, ascending within the collection.
    pub number: u32,
}

impl DocId {
    /// Creates a document address.
    pub const fn new(collection: u32, number: u32) -> Self {
        Self { collection, number }
    }
}

/// Immutable hierarchical node identifier.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeweyId {
    doc: DocId,
    divisions: Divisions,
}

impl DeweyId {
    /// Validates `divisions` and builds an identifier.
    pub fn new(doc: DocId, divisions: &[u32]) -> Result<Self> {
        validate(divisions)?;
        Ok(Self {
            doc,
            divisions: Divisions::from_slice(divisions),
        })
    }

    pub(crate) fn from_parts(doc: DocId, divisions: Divisions) -> Self {
        debug_assert!(validate(&divisions).is_ok(), "invalid divisions {divisions:?}");
        Self { doc, divisions }
    }

    /// Identifier of the root node of `doc`.
    pub fn document_root(doc: DocId) -> Self {
        let mut divisions = Divisions::new();
        divisions.push(ROOT_DIVISION);
        Self { doc, divisions }
    }

    /// Parses the `collection/number:d.d.d` form produced by `Display`.
    pub fn parse(text: &str) -> Result<Self> {
        let (doc_part, path) = text
            .split_once(':')
            .ok_or(ArborError::Invalid("identifier missing ':' separator"))?;
        let (collection, number) = doc_part
            .split_once('/')
            .ok_or(ArborError::Invalid("identifier missing '/' separator"))?;
        let collection = collection
            .parse::<u32>()
            .map_err(|_| ArborError::InvalidOwned(format!("bad collection in {text}")))?;
        let number = number
            .parse::<u32>()
            .map_err(|_| ArborError::InvalidOwned(format!("bad document number in {text}")))?;
        let mut divisions = Divisions::new();
        for part in path.split('.') {
            let value = part
                .parse::<u32>()
                .map_err(|_| ArborError::InvalidOwned(format!("bad division in {text}")))?;
            divisions.push(value);
        }
        Self::new(DocId::new(collection, number), &divisions)
    }

    /// Document the node belongs to.
    pub fn doc(&self) -> DocId {
        self.doc
    }

    /// Path of divisions from the document root.
    pub fn divisions(&self) -> &[u32] {
        &self.divisions
    }

    /// Index of the attribute marker, if this identifier names an attribute.
    pub fn attribute_marker(&self) -> Option<usize> {
        attribute_marker(&self.divisions)
    }

    /// True for attribute nodes.
    pub fn is_attribute(&self) -> bool {
        self.attribute_marker().is_some()
    }

    /// True for the document root.
    pub fn is_document_root(&self) -> bool {
        self.divisions.as_slice() == [ROOT_DIVISION]
    }

    /// Tree level: number of odd divisions, not counting the attribute marker.
    /// The document root is level 1.
    pub fn level(&self) -> usize {
        level_of(&self.divisions)
    }

    /// Length of the common division prefix with `other`.
    pub fn common_prefix_len(&self, other: &DeweyId) -> usize {
        common_prefix_len(&self.divisions, &other.divisions)
    }

    /// Parent node, `None` for the document root.
    pub fn parent(&self) -> Option<DeweyId> {
        let mut divisions = self.divisions.clone();
        if !strip_to_parent(&mut divisions) {
            return None;
        }
        Some(Self {
            doc: self.doc,
            divisions,
        })
    }

    /// Ancestor (or self) at `level`, if the identifier is that deep.
    pub fn ancestor_at_level(&self, level: usize) -> Option<DeweyId> {
        let mut current = self.clone();
        loop {
            let own = current.level();
            if own == level {
                return Some(current);
            }
            if own < level {
                return None;
            }
            current = current.parent()?;
        }
    }

    /// True if `other` lies strictly below this node, attributes included.
    pub fn is_ancestor_of(&self, other: &DeweyId) -> bool {
        self.doc == other.doc
            && other.divisions.len() > self.divisions.len()
            && other.divisions.starts_with(&self.divisions)
    }

    /// True if `other` equals this node or lies below it.
    pub fn is_ancestor_or_self_of(&self, other: &DeweyId) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// True if this node is the parent of `other`.
    pub fn is_parent_of(&self, other: &DeweyId) -> bool {
        self.is_ancestor_of(other) && other.level() == self.level() + 1
    }

    /// True if both nodes share a parent and are of the same kind
    /// (attribute or child).
    pub fn is_sibling_of(&self, other: &DeweyId) -> bool {
        if self == other || self.is_attribute() != other.is_attribute() {
            return false;
        }
        match (self.parent(), other.parent()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Smallest identifier a first child of this node receives.
    pub fn first_child(&self) -> Result<DeweyId> {
        if self.is_attribute() {
            return Err(ArborError::Invalid("attributes have no children"));
        }
        let mut divisions = self.divisions.clone();
        divisions.push(FIRST_CHILD_DIVISION);
        Ok(Self {
            doc: self.doc,
            divisions,
        })
    }

    /// Allocates a child of `parent` strictly between `left` and `right`
    /// (either bound may be open).
    pub fn new_child_between(
        parent: &DeweyId,
        left: Option<&DeweyId>,
        right: Option<&DeweyId>,
    ) -> Result<DeweyId> {
        if parent.is_attribute() {
            return Err(ArborError::Invalid("attributes have no children"));
        }
        let base = parent.divisions.len();
        let local = |id: &DeweyId| -> Result<Divisions> {
            if !parent.is_parent_of(id) || id.is_attribute() {
                return Err(ArborError::Invalid("bound is not a child of the parent"));
            }
            Ok(Divisions::from_slice(&id.divisions[base..]))
        };
        let lower = left.map(local).transpose()?;
        let upper = right.map(local).transpose()?;
        if let (Some(l), Some(u)) = (&lower, &upper) {
            if l >= u {
                return Err(ArborError::Invalid("left bound must sort before right bound"));
            }
        }
        let suffix = between_local(lower.as_deref(), upper.as_deref())?;
        let mut divisions = parent.divisions.clone();
        divisions.extend_from_slice(&suffix);
        Ok(Self::from_parts(parent.doc, divisions))
    }

    /// Allocates the attribute of `owner` following `after` (or the first
    /// attribute). Attributes are unordered, so new ones are appended.
    pub fn new_attribute(owner: &DeweyId, after: Option<&DeweyId>) -> Result<DeweyId> {
        if owner.is_attribute() {
            return Err(ArborError::Invalid("attributes have no attributes"));
        }
        let next = match after {
            None => FIRST_CHILD_DIVISION,
            Some(prev) => {
                if !prev.is_attribute() || !owner.is_parent_of(prev) {
                    return Err(ArborError::Invalid("bound is not an attribute of the owner"));
                }
                let last = *prev.divisions.last().unwrap_or(&FIRST_CHILD_DIVISION);
                last.checked_add(2)
                    .ok_or(ArborError::Invalid("attribute division exhausted"))?
            }
        };
        let mut divisions = owner.divisions.clone();
        divisions.push(ATTRIBUTE_MARKER);
        divisions.push(next);
        Ok(Self::from_parts(owner.doc, divisions))
    }

    /// Bytes [`DeweyId::encode_into`] writes.
    pub fn encoded_len(&self) -> usize {
        8 + self
            .divisions
            .iter()
            .map(|&d| ord::division_len(d))
            .sum::<usize>()
    }

    /// Appends the order-preserving binary form.
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        ord::put_u32_be(dst, self.doc.collection);
        ord::put_u32_be(dst, self.doc.number);
        for &division in &self.divisions {
            ord::put_division(dst, division);
        }
    }

    /// Order-preserving binary form: byte order equals identifier order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decodes an identifier occupying all of `src`.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(src);
        let collection = reader.u32()?;
        let number = reader.u32()?;
        let mut divisions = Divisions::new();
        let mut off = reader.offset();
        while off < src.len() {
            divisions.push(ord::get_division(src, &mut off)?);
        }
        validate(&divisions).map_err(|_| ArborError::Corruption("stored identifier is malformed"))?;
        Ok(Self {
            doc: DocId::new(collection, number),
            divisions,
        })
    }
}

impl Ord for DeweyId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.doc
            .cmp(&other.doc)
            .then_with(|| self.divisions.as_slice().cmp(other.divisions.as_slice()))
    }
}

impl PartialOrd for DeweyId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DeweyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:", self.doc.collection, self.doc.number)?;
        for (idx, division) in self.divisions.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            write!(f, "{division}")?;
        }
        Ok(())
    }
}

pub(crate) fn attribute_marker(divisions: &[u32]) -> Option<usize> {
    let len = divisions.len();
    if len >= 3 && divisions[len - 2] == ATTRIBUTE_MARKER {
        Some(len - 2)
    } else {
        None
    }
}

pub(crate) fn level_of(divisions: &[u32]) -> usize {
    let odd = divisions.iter().filter(|&&d| d % 2 == 1).count();
    if attribute_marker(divisions).is_some() {
        odd - 1
    } else {
        odd
    }
}

pub(crate) fn common_prefix_len(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Rewrites `divisions` into the parent path. Returns false at the root.
pub(crate) fn strip_to_parent(divisions: &mut Divisions) -> bool {
    if divisions.len() <= 1 {
        return false;
    }
    divisions.pop();
    while divisions.len() > 1 && divisions.last().map_or(false, |d| d % 2 == 0) {
        divisions.pop();
    }
    if divisions.len() > 1 && divisions.last() == Some(&ATTRIBUTE_MARKER) {
        divisions.pop();
    }
    true
}

fn validate(divisions: &[u32]) -> Result<()> {
    let (&last, _) = divisions
        .split_last()
        .ok_or(ArborError::Invalid("identifier needs at least one division"))?;
    if divisions.iter().any(|&d| d == 0) {
        return Err(ArborError::Invalid("division zero is reserved"));
    }
    if last % 2 == 0 {
        return Err(ArborError::Invalid("last division must be odd"));
    }
    let len = divisions.len();
    for (idx, &d) in divisions.iter().enumerate().skip(1) {
        if d == ATTRIBUTE_MARKER && idx + 2 != len {
            return Err(ArborError::Invalid(
                "attribute marker must be followed by exactly one division",
            ));
        }
    }
    Ok(())
}

fn next_odd(value: u32) -> u32 {
    if value % 2 == 1 {
        value + 2
    } else {
        value + 1
    }
}

/// Computes a local label strictly between two sibling labels relative to
/// their common parent. Labels never start with the reserved division 1.
fn between_local(lower: Option<&[u32]>, upper: Option<&[u32]>) -> Result<Divisions> {
    let mut out = Divisions::new();
    match (lower, upper) {
        (None, None) => out.push(FIRST_CHILD_DIVISION),
        (Some(l), None) => {
            let first = *l.first().ok_or(ArborError::Invalid("empty sibling label"))?;
            out.push(
                first
                    .checked_add(if first % 2 == 1 { 2 } else { 1 })
                    .ok_or(ArborError::Invalid("sibling division exhausted"))?,
            );
        }
        (None, Some(u)) => {
            for &v in u {
                if v <= ATTRIBUTE_MARKER {
                    return Err(ArborError::Invalid("sibling label uses reserved division"));
                }
                if v > FIRST_CHILD_DIVISION {
                    let mid = (FIRST_CHILD_DIVISION + v) / 2;
                    out.push(if mid % 2 == 0 { mid - 1 } else { mid });
                    return Ok(out);
                }
                out.push(2);
                if v == FIRST_CHILD_DIVISION {
                    out.push(FIRST_CHILD_DIVISION);
                    return Ok(out);
                }
            }
            return Err(ArborError::Invalid("upper sibling label ends on overflow division"));
        }
        (Some(l), Some(u)) => {
            let mut idx = 0;
            loop {
                let (a, b) = match (l.get(idx), u.get(idx)) {
                    (Some(&a), Some(&b)) => (a, b),
                    (None, Some(_)) => {
                        out.extend_from_slice(&between_local(None, Some(&u[idx..]))?);
                        return Ok(out);
                    }
                    _ => return Err(ArborError::Invalid("sibling bounds are not ordered")),
                };
                if a == b {
                    out.push(a);
                    idx += 1;
                    continue;
                }
                if a > b {
                    return Err(ArborError::Invalid("sibling bounds are not ordered"));
                }
                if b - a >= 2 {
                    let mid = a + (b - a) / 2;
                    let odd = if mid % 2 == 1 {
                        Some(mid)
                    } else if mid + 1 < b {
                        Some(mid + 1)
                    } else if mid - 1 > a {
                        Some(mid - 1)
                    } else {
                        None
                    };
                    match odd {
                        Some(value) => out.push(value),
                        None => {
                            out.push(a + 1);
                            out.push(FIRST_CHILD_DIVISION);
                        }
                    }
                    return Ok(out);
                }
                if a % 2 == 1 {
                    out.push(b);
                    out.extend_from_slice(&between_local(None, Some(&u[idx + 1..]))?);
                } else {
                    out.push(a);
                    out.extend_from_slice(&between_local(Some(&l[idx + 1..]), None)?);
                }
                return Ok(out);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(text: &str) -> DeweyId {
        DeweyId::parse(text).unwrap()
    }

    #[test]
    fn parse_and_display_roundtrip() {
        let node = id("2/7:1.3.4.5");
        assert_eq!(node.doc(), DocId::new(2, 7));
        assert_eq!(node.divisions(), &[1, 3, 4, 5]);
        assert_eq!(node.to_string(), "2/7:1.3.4.5");
    }

    #[test]
    fn validation_rejects_malformed_paths() {
        let doc = DocId::new(0, 0);
        assert!(DeweyId::new(doc, &[]).is_err());
        assert!(DeweyId::new(doc, &[1, 4]).is_err());
        assert!(DeweyId::new(doc, &[1, 0, 3]).is_err());
        assert!(DeweyId::new(doc, &[1, 3, 1]).is_err());
        assert!(DeweyId::new(doc, &[1, 3, 1, 3, 5]).is_err());
        assert!(DeweyId::new(doc, &[1, 3, 1, 3]).is_ok());
    }

    #[test]
    fn level_skips_overflow_and_marker() {
        assert_eq!(id("0/0:1").level(), 1);
        assert_eq!(id("0/0:1.3").level(), 2);
        assert_eq!(id("0/0:1.4.3").level(), 2);
        assert_eq!(id("0/0:1.3.1.5").level(), 3);
        assert!(id("0/0:1.3.1.5").is_attribute());
        assert!(!id("0/0:1.3.5").is_attribute());
    }

    #[test]
    fn parent_strips_overflow_and_marker() {
        assert_eq!(id("0/0:1.4.3").parent(), Some(id("0/0:1")));
        assert_eq!(id("0/0:1.3.2.2.5").parent(), Some(id("0/0:1.3")));
        assert_eq!(id("0/0:1.3.1.5").parent(), Some(id("0/0:1.3")));
        assert_eq!(id("0/0:1.3.5").parent(), Some(id("0/0:1.3")));
        assert_eq!(id("0/0:1").parent(), None);
    }

    #[test]
    fn ancestry_relations() {
        let root = id("0/0:1");
        let child = id("0/0:1.3");
        let grandchild = id("0/0:1.3.2.3");
        let attr = id("0/0:1.3.1.3");
        assert!(root.is_ancestor_of(&grandchild));
        assert!(child.is_parent_of(&grandchild));
        assert!(child.is_parent_of(&attr));
        assert!(!root.is_parent_of(&grandchild));
        assert!(!grandchild.is_sibling_of(&attr));
        assert!(id("0/0:1.3").is_sibling_of(&id("0/0:1.4.3")));
        assert_eq!(grandchild.ancestor_at_level(2), Some(child.clone()));
        assert_eq!(grandchild.ancestor_at_level(1), Some(root));
        assert_eq!(child.ancestor_at_level(3), None);
    }

    #[test]
    fn ordering_puts_ancestors_first() {
        let mut ids = vec![
            id("0/1:1"),
            id("0/0:1.5"),
            id("0/0:1.3.3"),
            id("0/0:1.3.1.3"),
            id("0/0:1.3"),
            id("0/0:1.4.3"),
            id("0/0:1"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["0/0:1", "0/0:1.3", "0/0:1.3.1.3", "0/0:1.3.3", "0/0:1.4.3", "0/0:1.5", "0/1:1"]
        );
    }

    #[test]
    fn between_allocates_overflow_when_odd_slots_run_out() -> Result<()> {
        let parent = id("0/0:1");
        let x = DeweyId::new_child_between(&parent, Some(&id("0/0:1.3")), Some(&id("0/0:1.5")))?;
        assert_eq!(x, id("0/0:1.4.3"));
        let first = DeweyId::new_child_between(&parent, None, Some(&id("0/0:1.3")))?;
        assert_eq!(first, id("0/0:1.2.3"));
        let last = DeweyId::new_child_between(&parent, Some(&id("0/0:1.7")), None)?;
        assert_eq!(last, id("0/0:1.9"));
        let wide = DeweyId::new_child_between(&parent, Some(&id("0/0:1.3")), Some(&id("0/0:1.11")))?;
        assert_eq!(wide, id("0/0:1.7"));
        assert_eq!(DeweyId::new_child_between(&parent, None, None)?, id("0/0:1.3"));
        Ok(())
    }

    #[test]
    fn attributes_are_appended() -> Result<()> {
        let owner = id("0/0:1.3");
        let a = DeweyId::new_attribute(&owner, None)?;
        let b = DeweyId::new_attribute(&owner, Some(&a))?;
        assert_eq!(a, id("0/0:1.3.1.3"));
        assert_eq!(b, id("0/0:1.3.1.5"));
        assert!(DeweyId::new_attribute(&a, None).is_err());
        Ok(())
    }

    #[test]
    fn binary_form_roundtrips() -> Result<()> {
        let node = id("3/9:1.3.200.70000.5");
        let bytes = node.to_bytes();
        assert_eq!(bytes.len(), node.encoded_len());
        assert_eq!(DeweyId::from_bytes(&bytes)?, node);
        Ok(())
    }

    fn child_label() -> impl Strategy<Value = Vec<u32>> {
        (
            proptest::collection::vec(1u32..40, 0..3),
            0u32..40,
        )
            .prop_map(|(prefix, last)| {
                let mut label: Vec<u32> = prefix.into_iter().map(|v| v * 2 + 2).collect();
                label.push(last * 2 + 3);
                label
            })
    }

    proptest! {
        #[test]
        fn between_is_strictly_between(a in child_label(), b in child_label()) {
            prop_assume!(a != b);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            let parent = id("0/0:1.3");
            let mk = |label: &[u32]| {
                let mut divs = vec![1, 3];
                divs.extend_from_slice(label);
                DeweyId::new(DocId::new(0, 0), &divs).unwrap()
            };
            let left = mk(&lo);
            let right = mk(&hi);
            let mid = DeweyId::new_child_between(&parent, Some(&left), Some(&right)).unwrap();
            prop_assert!(left < mid && mid < right, "{} < {} < {}", left, mid, right);
            prop_assert!(parent.is_parent_of(&mid));
            let before = DeweyId::new_child_between(&parent, None, Some(&left)).unwrap();
            prop_assert!(before < left && parent.is_parent_of(&before));
            let after = DeweyId::new_child_between(&parent, Some(&right), None).unwrap();
            prop_assert!(after > right && parent.is_parent_of(&after));
        }

        #[test]
        fn byte_order_matches_identifier_order(
            a in child_label(), b in child_label(), da in 0u32..3, db in 0u32..3
        ) {
            let mk = |doc: u32, label: &[u32]| {
                let mut divs = vec![1];
                divs.extend_from_slice(label);
                DeweyId::new(DocId::new(1, doc), &divs).unwrap()
            };
            let x = mk(da, &a);
            let y = mk(db, &b);
            prop_assert_eq!(x.cmp(&y), x.to_bytes().cmp(&y.to_bytes()));
        }
    }
}
