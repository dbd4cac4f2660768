//! Three-byte delta keys ("bracket keys") between consecutive identifiers.
//!
//! Layout: byte 0 holds the key type in its top three bits and the angle
//! bracket count in the low five, byte 1 the round bracket count and byte 2
//! the sibling gap. A document key reinterprets the 21 low bits as the gap
//! between two document numbers.

use smallvec::SmallVec;

use crate::types::dewey::{attribute_marker, common_prefix_len};
use crate::types::{ArborError, DeweyId, Result};

/// Encoded size of one key.
pub const KEY_LEN: usize = 3;
/// Largest round bracket count a key can carry.
pub const MAX_ROUND_BRACKETS: u32 = u8::MAX as u32;
/// Largest angle bracket count a key can carry.
pub const MAX_ANGLE_BRACKETS: u32 = 0x1F;
/// Largest sibling gap a key can carry.
pub const MAX_ID_GAPS: u32 = u8::MAX as u32;
/// Largest document-number gap a single document key can carry.
pub const MAX_DOCUMENT_GAP: u32 = (1 << 21) - 1;

const TYPE_SHIFT: u8 = 5;
const ANGLE_MASK: u8 = 0x1F;

/// Keys emitted for one identifier; bridges and deep paths are rare.
pub type KeyChain = SmallVec<[BracketKey; 4]>;

/// What a key denotes once replayed.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyType {
    /// A stored node carrying a value.
    Data = 1,
    /// An inner path step without a stored node.
    NoData = 2,
    /// A stored attribute carrying a value.
    Attribute = 3,
    /// An even (overflow) path step.
    Overflow = 4,
    /// A document-number advance.
    Document = 5,
}

impl KeyType {
    /// True for keys that own a value reference.
    pub fn has_data(self) -> bool {
        matches!(self, KeyType::Data | KeyType::Attribute)
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            1 => Ok(KeyType::Data),
            2 => Ok(KeyType::NoData),
            3 => Ok(KeyType::Attribute),
            4 => Ok(KeyType::Overflow),
            5 => Ok(KeyType::Document),
            _ => Err(ArborError::Corruption("unknown bracket key type")),
        }
    }
}

/// One delta step.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BracketKey {
    kind: KeyType,
    round: u8,
    angle: u8,
    gaps: u8,
}

impl BracketKey {
    /// Builds a structural key. Counters that do not fit their width yield
    /// [`ArborError::EncodingOverflow`].
    pub fn new(kind: KeyType, round: u32, angle: u32, gaps: u32) -> Result<Self> {
        if kind == KeyType::Document {
            return Err(ArborError::Invalid("use BracketKey::document for document keys"));
        }
        if round > MAX_ROUND_BRACKETS {
            return Err(ArborError::EncodingOverflow("too many round brackets"));
        }
        if angle > MAX_ANGLE_BRACKETS {
            return Err(ArborError::EncodingOverflow("too many angle brackets"));
        }
        if gaps > MAX_ID_GAPS {
            return Err(ArborError::EncodingOverflow("sibling gap too large"));
        }
        Ok(Self {
            kind,
            round: round as u8,
            angle: angle as u8,
            gaps: gaps as u8,
        })
    }

    /// Builds a document key advancing the document number by `gap`.
    pub fn document(gap: u32) -> Result<Self> {
        if gap == 0 {
            return Err(ArborError::Invalid("document gap must be positive"));
        }
        if gap > MAX_DOCUMENT_GAP {
            return Err(ArborError::EncodingOverflow("document gap too large"));
        }
        Ok(Self {
            kind: KeyType::Document,
            angle: (gap >> 16) as u8,
            round: (gap >> 8) as u8,
            gaps: gap as u8,
        })
    }

    /// Key type.
    pub fn kind(&self) -> KeyType {
        self.kind
    }

    /// Closed odd divisions.
    pub fn round_brackets(&self) -> u32 {
        self.round as u32
    }

    /// Closed even divisions.
    pub fn angle_brackets(&self) -> u32 {
        self.angle as u32
    }

    /// Total closed divisions.
    pub fn closing_brackets(&self) -> u32 {
        self.round as u32 + self.angle as u32
    }

    /// Skipped odd sibling slots.
    pub fn id_gaps(&self) -> u32 {
        self.gaps as u32
    }

    /// Document-number advance; zero for structural keys.
    pub fn document_gap(&self) -> u32 {
        if self.kind != KeyType::Document {
            return 0;
        }
        ((self.angle as u32) << 16) | ((self.round as u32) << 8) | self.gaps as u32
    }

    /// True for keys that own a value reference.
    pub fn has_data(&self) -> bool {
        self.kind.has_data()
    }

    /// On-page form.
    pub fn encode(&self) -> [u8; KEY_LEN] {
        [
            ((self.kind as u8) << TYPE_SHIFT) | (self.angle & ANGLE_MASK),
            self.round,
            self.gaps,
        ]
    }

    /// Decodes the key at the start of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let raw = src
            .get(..KEY_LEN)
            .ok_or(ArborError::Corruption("bracket key truncated"))?;
        Ok(Self {
            kind: KeyType::from_bits(raw[0] >> TYPE_SHIFT)?,
            angle: raw[0] & ANGLE_MASK,
            round: raw[1],
            gaps: raw[2],
        })
    }
}

pub(crate) fn next_odd(value: u32) -> Option<u32> {
    value.checked_add(if value % 2 == 1 { 2 } else { 1 })
}

/// Computes the keys that turn `previous` into `current`.
///
/// Both identifiers must belong to the same collection and `current` must
/// sort after `previous`. Gaps wider than one key are bridged with phantom
/// `NoData` keys; bracket counts that do not fit are reported as
/// [`ArborError::EncodingOverflow`].
pub fn generate_keys(previous: &DeweyId, current: &DeweyId) -> Result<KeyChain> {
    if previous.doc().collection != current.doc().collection {
        return Err(ArborError::Invalid("bracket keys cannot cross collections"));
    }
    if current <= previous {
        return Err(ArborError::Invalid("identifiers must be strictly ascending"));
    }
    let mut keys = KeyChain::new();
    let cur = current.divisions();
    let (base, prefix): (&[u32], usize) = if current.doc().number != previous.doc().number {
        let mut gap = current.doc().number - previous.doc().number;
        while gap > 0 {
            let step = gap.min(MAX_DOCUMENT_GAP);
            keys.push(BracketKey::document(step)?);
            gap -= step;
        }
        (&[], 0)
    } else {
        let prev = previous.divisions();
        (prev, common_prefix_len(prev, cur))
    };

    let (mut round, mut angle) = (0u32, 0u32);
    for &division in &base[prefix..] {
        if division % 2 == 1 {
            round += 1;
        } else {
            angle += 1;
        }
    }
    let mut anchor = if round + angle > 0 {
        Some(base[prefix])
    } else {
        None
    };
    let marker = attribute_marker(cur);
    let last = cur.len() - 1;

    for (idx, &target) in cur.iter().enumerate().skip(prefix) {
        if Some(idx) == marker {
            continue;
        }
        let kind = if idx == last {
            if marker.is_some() {
                KeyType::Attribute
            } else {
                KeyType::Data
            }
        } else if target % 2 == 0 {
            KeyType::Overflow
        } else {
            KeyType::NoData
        };
        let mut start = match anchor.take() {
            Some(value) => next_odd(value).ok_or(ArborError::Invalid("division overflow"))?,
            None if idx == 0 => 1,
            None => 3,
        };
        let odd_target = target | 1;
        loop {
            if odd_target < start {
                return Err(ArborError::Invalid("division below the reachable range"));
            }
            let gap = (odd_target - start) / 2;
            if gap <= MAX_ID_GAPS {
                keys.push(BracketKey::new(kind, round, angle, gap)?);
                break;
            }
            keys.push(BracketKey::new(KeyType::NoData, round, angle, MAX_ID_GAPS)?);
            let bridge = start + 2 * MAX_ID_GAPS;
            start = bridge + 2;
            round = 1;
            angle = 0;
        }
        round = 0;
        angle = 0;
    }
    Ok(keys)
}

/// Encoded size of a chain in the key area (value references excluded).
pub fn chain_len(keys: &[BracketKey]) -> usize {
    keys.len() * KEY_LEN
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::bracket::id_buffer::DeweyIdBuffer;
    use crate::types::DocId;
    use proptest::prelude::*;

    fn id(text: &str) -> DeweyId {
        DeweyId::parse(text).unwrap()
    }

    fn replay(from: &DeweyId, keys: &[BracketKey]) -> DeweyId {
        let mut buffer = DeweyIdBuffer::from_id(from);
        for key in keys {
            buffer.update(*key).unwrap();
        }
        buffer.to_id().unwrap()
    }

    #[test]
    fn key_layout_is_bit_exact() -> Result<()> {
        let key = BracketKey::new(KeyType::Overflow, 7, 3, 9)?;
        assert_eq!(key.encode(), [(4 << 5) | 3, 7, 9]);
        assert_eq!(BracketKey::decode(&key.encode())?, key);
        let doc = BracketKey::document(0x12_3456)?;
        assert_eq!(doc.encode(), [(5 << 5) | 0x12, 0x34, 0x56]);
        assert_eq!(BracketKey::decode(&doc.encode())?.document_gap(), 0x12_3456);
        Ok(())
    }

    #[test]
    fn single_key_rejects_oversized_counters() {
        assert!(matches!(
            BracketKey::new(KeyType::Data, 256, 0, 0),
            Err(ArborError::EncodingOverflow(_))
        ));
        assert!(matches!(
            BracketKey::new(KeyType::Data, 0, 32, 0),
            Err(ArborError::EncodingOverflow(_))
        ));
        assert!(matches!(
            BracketKey::new(KeyType::Data, 0, 0, 256),
            Err(ArborError::EncodingOverflow(_))
        ));
        assert!(BracketKey::document(MAX_DOCUMENT_GAP + 1).is_err());
        assert!(BracketKey::decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn sibling_step_is_one_key() -> Result<()> {
        let keys = generate_keys(&id("0/0:1.3"), &id("0/0:1.5"))?;
        assert_eq!(keys.as_slice(), &[BracketKey::new(KeyType::Data, 1, 0, 0)?]);
        let keys = generate_keys(&id("0/0:1.3"), &id("0/0:1.9"))?;
        assert_eq!(keys.as_slice(), &[BracketKey::new(KeyType::Data, 1, 0, 2)?]);
        Ok(())
    }

    #[test]
    fn child_step_and_overflow_path() -> Result<()> {
        let keys = generate_keys(&id("0/0:1"), &id("0/0:1.3"))?;
        assert_eq!(keys.as_slice(), &[BracketKey::new(KeyType::Data, 0, 0, 0)?]);
        let keys = generate_keys(&id("0/0:1.3"), &id("0/0:1.4.3"))?;
        assert_eq!(
            keys.as_slice(),
            &[
                BracketKey::new(KeyType::Overflow, 1, 0, 0)?,
                BracketKey::new(KeyType::Data, 0, 0, 0)?,
            ]
        );
        assert_eq!(replay(&id("0/0:1.3"), &keys), id("0/0:1.4.3"));
        Ok(())
    }

    #[test]
    fn closing_brackets_count_odd_and_even() -> Result<()> {
        let keys = generate_keys(&id("0/0:1.3.2.5.7"), &id("0/0:1.5"))?;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].round_brackets(), 3);
        assert_eq!(keys[0].angle_brackets(), 1);
        assert_eq!(replay(&id("0/0:1.3.2.5.7"), &keys), id("0/0:1.5"));
        Ok(())
    }

    #[test]
    fn attributes_place_their_marker() -> Result<()> {
        let owner = id("0/0:1.3");
        let first = id("0/0:1.3.1.3");
        let second = id("0/0:1.3.1.5");
        let keys = generate_keys(&owner, &first)?;
        assert_eq!(keys.as_slice(), &[BracketKey::new(KeyType::Attribute, 0, 0, 0)?]);
        assert_eq!(replay(&owner, &keys), first);
        let keys = generate_keys(&first, &second)?;
        assert_eq!(keys.as_slice(), &[BracketKey::new(KeyType::Attribute, 1, 0, 0)?]);
        assert_eq!(replay(&first, &keys), second);
        let child = id("0/0:1.3.3");
        let keys = generate_keys(&second, &child)?;
        assert_eq!(keys[0].round_brackets(), 2);
        assert_eq!(replay(&second, &keys), child);
        let cousin = id("0/0:1.5.1.3");
        let keys = generate_keys(&second, &cousin)?;
        assert_eq!(replay(&second, &keys), cousin);
        Ok(())
    }

    #[test]
    fn wide_gaps_are_bridged() -> Result<()> {
        let from = id("0/0:1.3");
        let to = id("0/0:1.1001");
        let keys = generate_keys(&from, &to)?;
        assert!(keys.len() > 1);
        assert!(keys[..keys.len() - 1]
            .iter()
            .all(|k| k.kind() == KeyType::NoData));
        assert_eq!(replay(&from, &keys), to);
        let attr = id("0/0:1.3.1.999");
        let keys = generate_keys(&from, &attr)?;
        assert_eq!(replay(&from, &keys), attr);
        Ok(())
    }

    #[test]
    fn document_changes_reset_the_path() -> Result<()> {
        let from = id("4/1:1.3.5");
        let to = id("4/3:1.3");
        let keys = generate_keys(&from, &to)?;
        assert_eq!(keys[0].kind(), KeyType::Document);
        assert_eq!(keys[0].document_gap(), 2);
        assert_eq!(replay(&from, &keys), to);
        Ok(())
    }

    #[test]
    fn deep_closing_overflows() {
        let mut divisions = vec![1u32];
        divisions.extend(std::iter::repeat(3).take(300));
        let deep = DeweyId::new(DocId::new(0, 0), &divisions).unwrap();
        let err = generate_keys(&deep, &id("0/0:1.5")).unwrap_err();
        assert!(matches!(err, ArborError::EncodingOverflow(_)));
    }

    #[test]
    fn rejects_descending_or_foreign_pairs() {
        assert!(generate_keys(&id("0/0:1.5"), &id("0/0:1.3")).is_err());
        assert!(generate_keys(&id("0/0:1.5"), &id("0/0:1.5")).is_err());
        assert!(generate_keys(&id("0/0:1.5"), &id("1/0:1.7")).is_err());
    }

    pub(crate) fn arb_id() -> impl Strategy<Value = DeweyId> {
        let label = (proptest::collection::vec(1u32..300, 0..2), 0u32..700).prop_map(|(evens, odd)| {
            let mut label: Vec<u32> = evens.into_iter().map(|v| v * 2).collect();
            label.push(odd * 2 + 3);
            label
        });
        (
            0u32..4,
            proptest::collection::vec(label, 0..4),
            proptest::option::of(0u32..400),
        )
            .prop_map(|(doc, labels, attribute)| {
                let mut divisions = vec![1u32];
                for label in labels {
                    divisions.extend(label);
                }
                if let Some(attr) = attribute {
                    divisions.push(1);
                    divisions.push(attr * 2 + 3);
                }
                DeweyId::new(DocId::new(9, doc), &divisions).unwrap()
            })
    }

    proptest! {
        #[test]
        fn replay_reconstructs_successor(a in arb_id(), b in arb_id()) {
            prop_assume!(a != b);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            let keys = generate_keys(&lo, &hi).unwrap();
            prop_assert!(keys.last().map_or(false, |k| k.has_data()));
            prop_assert_eq!(replay(&lo, &keys), hi);
        }
    }
}
