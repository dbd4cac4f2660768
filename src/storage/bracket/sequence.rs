//! Page-independent runs of encoded nodes.
//!
//! A sequence keeps its low key verbatim and every following node as the
//! bracket keys leading to it, each data key followed by its value field.
//! Splits move the tail of a leaf through a sequence and merges append one.

use crate::primitives::bytes::buf::Reader;
use crate::storage::bracket::id_buffer::DeweyIdBuffer;
use crate::storage::bracket::key::{generate_keys, BracketKey, KEY_LEN};
use crate::storage::bracket::value::StoredValue;
use crate::types::{ArborError, DeweyId, Result};

/// Bytes a leaf spends on a value reference.
pub(crate) const VALUE_REF_LEN: usize = 2;

/// Ordered run of nodes of one collection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeSequence {
    collection: u32,
    low: Option<DeweyId>,
    high: Option<DeweyId>,
    body: Vec<u8>,
    records: usize,
}

/// One step of a raw walk: the key (absent for the low key) and the value
/// field following it.
pub(crate) struct RawEntry<'a> {
    pub key: Option<BracketKey>,
    pub value: Option<StoredValue<'a>>,
}

impl NodeSequence {
    /// Sequence without nodes.
    pub fn empty(collection: u32) -> Self {
        Self {
            collection,
            low: None,
            high: None,
            body: Vec::new(),
            records: 0,
        }
    }

    /// Sequence holding one node.
    pub fn from_node(id: &DeweyId, value: StoredValue<'_>) -> Result<Self> {
        let mut seq = Self::empty(id.doc().collection);
        seq.push(id, value)?;
        Ok(seq)
    }

    /// Collection all nodes belong to.
    pub fn collection(&self) -> u32 {
        self.collection
    }

    /// First identifier.
    pub fn low_key(&self) -> Option<&DeweyId> {
        self.low.as_ref()
    }

    /// Last identifier.
    pub fn high_key(&self) -> Option<&DeweyId> {
        self.high.as_ref()
    }

    /// Nodes carrying a value, low key included.
    pub fn number_of_data_records(&self) -> usize {
        self.records
    }

    /// True without nodes.
    pub fn is_empty(&self) -> bool {
        self.low.is_none()
    }

    /// Drops every node.
    pub fn clear(&mut self) {
        self.low = None;
        self.high = None;
        self.body.clear();
        self.records = 0;
    }

    /// Bytes the nodes occupy once written into a leaf.
    pub fn page_len(&self) -> usize {
        match &self.low {
            Some(low) => low.encoded_len() + self.body.len() + VALUE_REF_LEN * self.records,
            None => 0,
        }
    }

    /// Appends a node above the current high key.
    pub fn push(&mut self, id: &DeweyId, value: StoredValue<'_>) -> Result<()> {
        value.check()?;
        match &self.high {
            None => {
                if id.doc().collection != self.collection {
                    return Err(ArborError::Invalid("node belongs to another collection"));
                }
                self.low = Some(id.clone());
            }
            Some(high) => {
                for key in generate_keys(high, id)? {
                    self.body.extend_from_slice(&key.encode());
                }
            }
        }
        value.encode_into(&mut self.body);
        self.high = Some(id.clone());
        self.records += 1;
        Ok(())
    }

    /// Appends `other`, whose low key must follow this sequence's high key.
    pub fn append(&mut self, other: NodeSequence) -> Result<()> {
        let Some(other_low) = other.low.as_ref() else {
            return Ok(());
        };
        let Some(high) = self.high.as_ref() else {
            *self = other;
            return Ok(());
        };
        for key in generate_keys(high, other_low)? {
            self.body.extend_from_slice(&key.encode());
        }
        self.body.extend_from_slice(&other.body);
        self.records += other.records;
        self.high = other.high;
        Ok(())
    }

    /// Splits off the nodes from data record `index` on.
    pub fn split_off(&mut self, index: usize) -> Result<NodeSequence> {
        if index == 0 {
            return Ok(std::mem::replace(self, Self::empty(self.collection)));
        }
        if index >= self.records {
            return Ok(Self::empty(self.collection));
        }
        let Some(low) = self.low.as_ref() else {
            return Ok(Self::empty(self.collection));
        };
        let mut buffer = DeweyIdBuffer::from_id(low);
        let mut previous = low.clone();
        let mut off = skip_value(&self.body, 0)?;
        let mut seen = 1usize;
        loop {
            let chain_start = off;
            let data = loop {
                let key = BracketKey::decode(self.body.get(off..).unwrap_or(&[]))?;
                buffer.update(key)?;
                off += KEY_LEN;
                if key.has_data() {
                    break off;
                }
            };
            if seen == index {
                let cut = buffer.to_id()?;
                let mut tail = Self::empty(self.collection);
                tail.body.extend_from_slice(&self.body[data..]);
                tail.records = self.records - index;
                tail.high = self.high.take();
                tail.low = Some(cut);
                self.body.truncate(chain_start);
                self.records = index;
                self.high = Some(previous);
                return Ok(tail);
            }
            previous = buffer.to_id()?;
            off = skip_value(&self.body, data)?;
            seen += 1;
        }
    }

    /// Iterates over the nodes in order.
    pub fn iter(&self) -> SequenceIter<'_> {
        SequenceIter {
            seq: self,
            buffer: self.low.as_ref().map(DeweyIdBuffer::from_id),
            off: 0,
            started: false,
        }
    }

    pub(crate) fn raw_entries(&self) -> RawIter<'_> {
        RawIter {
            body: &self.body,
            off: 0,
            started: self.low.is_none(),
        }
    }

    /// Wire form: collection, record count, low key, body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(9 + self.page_len());
        out.extend_from_slice(&self.collection.to_be_bytes());
        out.extend_from_slice(&(self.records as u32).to_be_bytes());
        match &self.low {
            Some(low) => {
                let bytes = low.to_bytes();
                let len = u8::try_from(bytes.len())
                    .map_err(|_| ArborError::EncodingOverflow("low key longer than 255 bytes"))?;
                out.push(len);
                out.extend_from_slice(&bytes);
                out.extend_from_slice(&self.body);
            }
            None => out.push(0),
        }
        Ok(out)
    }

    /// Parses and validates the wire form.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(src);
        let collection = reader.u32()?;
        let records = reader.u32()? as usize;
        let low_len = reader.u8()? as usize;
        if low_len == 0 {
            if records != 0 || !reader.is_empty() {
                return Err(ArborError::Corruption("empty node sequence carries data"));
            }
            return Ok(Self::empty(collection));
        }
        let low = DeweyId::from_bytes(reader.take(low_len)?)?;
        if low.doc().collection != collection {
            return Err(ArborError::Corruption("node sequence mixes collections"));
        }
        let body = reader.take(reader.remaining())?.to_vec();
        let mut seq = Self {
            collection,
            low: Some(low.clone()),
            high: Some(low),
            body,
            records: 0,
        };
        let mut count = 0usize;
        let mut last = None;
        for entry in seq.iter() {
            let (id, _) = entry?;
            count += 1;
            last = Some(id);
        }
        if count != records {
            return Err(ArborError::Corruption("node sequence record count mismatch"));
        }
        seq.records = count;
        seq.high = last;
        Ok(seq)
    }
}

fn skip_value(body: &[u8], off: usize) -> Result<usize> {
    let (_, len) = StoredValue::decode(body.get(off..).unwrap_or(&[]))?;
    Ok(off + len)
}

/// Iterator over `(identifier, value)` pairs of a sequence.
pub struct SequenceIter<'a> {
    seq: &'a NodeSequence,
    buffer: Option<DeweyIdBuffer>,
    off: usize,
    started: bool,
}

impl<'a> SequenceIter<'a> {
    fn step(&mut self) -> Result<Option<(DeweyId, StoredValue<'a>)>> {
        let body: &'a [u8] = &self.seq.body;
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(None);
        };
        if !self.started {
            self.started = true;
            let (value, len) = StoredValue::decode(body)?;
            self.off = len;
            return Ok(Some((buffer.to_id()?, value)));
        }
        if self.off >= body.len() {
            return Ok(None);
        }
        loop {
            let key = BracketKey::decode(body.get(self.off..).unwrap_or(&[]))?;
            buffer.update(key)?;
            self.off += KEY_LEN;
            if key.has_data() {
                let (value, len) = StoredValue::decode(body.get(self.off..).unwrap_or(&[]))?;
                self.off += len;
                return Ok(Some((buffer.to_id()?, value)));
            }
            if self.off >= body.len() {
                return Err(ArborError::Corruption("node sequence ends inside a key chain"));
            }
        }
    }
}

impl<'a> Iterator for SequenceIter<'a> {
    type Item = Result<(DeweyId, StoredValue<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.buffer = None;
                Some(Err(err))
            }
        }
    }
}

/// Walk over keys and value fields without replaying identifiers.
pub(crate) struct RawIter<'a> {
    body: &'a [u8],
    off: usize,
    started: bool,
}

impl<'a> RawIter<'a> {
    fn step(&mut self) -> Result<Option<RawEntry<'a>>> {
        if !self.started {
            self.started = true;
            let (value, len) = StoredValue::decode(self.body)?;
            self.off = len;
            return Ok(Some(RawEntry { key: None, value: Some(value) }));
        }
        if self.off >= self.body.len() {
            return Ok(None);
        }
        let key = BracketKey::decode(&self.body[self.off..])?;
        self.off += KEY_LEN;
        let value = if key.has_data() {
            let (value, len) = StoredValue::decode(self.body.get(self.off..).unwrap_or(&[]))?;
            self.off += len;
            Some(value)
        } else {
            None
        };
        Ok(Some(RawEntry { key: Some(key), value }))
    }
}

impl<'a> Iterator for RawIter<'a> {
    type Item = Result<RawEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.off = self.body.len();
                Some(Err(err))
            }
        }
    }
}

impl Default for NodeSequence {
    fn default() -> Self {
        Self::empty(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::bracket::key::tests::arb_id;
    use proptest::prelude::*;

    fn id(text: &str) -> DeweyId {
        DeweyId::parse(text).unwrap()
    }

    fn build(ids: &[&str]) -> Result<NodeSequence> {
        let mut seq = NodeSequence::empty(0);
        for (n, text) in ids.iter().enumerate() {
            let value = vec![n as u8; n];
            seq.push(&id(text), StoredValue::Inline(&value))?;
        }
        Ok(seq)
    }

    fn ids_of(seq: &NodeSequence) -> Result<Vec<String>> {
        seq.iter()
            .map(|entry| entry.map(|(id, _)| id.to_string()))
            .collect()
    }

    #[test]
    fn push_and_iterate() -> Result<()> {
        let seq = build(&["0/0:1", "0/0:1.3", "0/0:1.3.1.3", "0/0:1.5", "0/2:1"])?;
        assert_eq!(seq.number_of_data_records(), 5);
        assert_eq!(seq.high_key(), Some(&id("0/2:1")));
        assert_eq!(
            ids_of(&seq)?,
            vec!["0/0:1", "0/0:1.3", "0/0:1.3.1.3", "0/0:1.5", "0/2:1"]
        );
        let values: Vec<Vec<u8>> = seq
            .iter()
            .map(|entry| match entry.unwrap().1 {
                StoredValue::Inline(bytes) => bytes.to_vec(),
                StoredValue::External(_) => Vec::new(),
            })
            .collect();
        assert_eq!(values[3], vec![3, 3, 3]);
        Ok(())
    }

    #[test]
    fn push_rejects_descending_and_foreign_collection() -> Result<()> {
        let mut seq = build(&["0/0:1", "0/0:1.5"])?;
        assert!(seq.push(&id("0/0:1.3"), StoredValue::Inline(b"x")).is_err());
        let mut other = NodeSequence::empty(3);
        assert!(other.push(&id("0/0:1"), StoredValue::Inline(b"x")).is_err());
        Ok(())
    }

    #[test]
    fn split_off_and_append_restore_the_run() -> Result<()> {
        let ids = ["0/0:1", "0/0:1.3", "0/0:1.3.3", "0/0:1.4.3", "0/0:1.5", "0/0:1.7"];
        let original = build(&ids)?;
        let mut head = original.clone();
        let tail = head.split_off(3)?;
        assert_eq!(tail.low_key(), Some(&id("0/0:1.4.3")));
        assert_eq!(head.high_key(), Some(&id("0/0:1.3.3")));
        assert_eq!(head.number_of_data_records() + tail.number_of_data_records(), 6);
        assert_eq!(ids_of(&tail)?, vec!["0/0:1.4.3", "0/0:1.5", "0/0:1.7"]);
        head.append(tail)?;
        assert_eq!(ids_of(&head)?, ids_of(&original)?);
        assert_eq!(head.high_key(), original.high_key());
        Ok(())
    }

    #[test]
    fn split_off_edges() -> Result<()> {
        let mut seq = build(&["0/0:1", "0/0:1.3"])?;
        assert!(seq.split_off(5)?.is_empty());
        let all = seq.split_off(0)?;
        assert!(seq.is_empty());
        assert_eq!(all.number_of_data_records(), 2);
        Ok(())
    }

    #[test]
    fn wire_form_is_validated() -> Result<()> {
        let seq = build(&["0/0:1", "0/0:1.3", "0/0:1.3.1.3"])?;
        let bytes = seq.to_bytes()?;
        assert_eq!(NodeSequence::from_bytes(&bytes)?, seq);
        let mut wrong_count = bytes.clone();
        wrong_count[7] = 9;
        assert!(NodeSequence::from_bytes(&wrong_count).is_err());
        let truncated = &bytes[..bytes.len() - 1];
        assert!(NodeSequence::from_bytes(truncated).is_err());
        let empty = NodeSequence::empty(4).to_bytes()?;
        assert!(NodeSequence::from_bytes(&empty)?.is_empty());
        Ok(())
    }

    proptest! {
        #[test]
        fn pushed_ids_replay_in_order(mut ids in proptest::collection::vec(arb_id(), 1..40)) {
            ids.sort();
            ids.dedup();
            let mut seq = NodeSequence::empty(ids[0].doc().collection);
            for id in &ids {
                if id.doc().collection != seq.collection() {
                    continue;
                }
                seq.push(id, StoredValue::Inline(b"v")).unwrap();
            }
            let kept: Vec<DeweyId> = ids
                .iter()
                .filter(|id| id.doc().collection == seq.collection())
                .cloned()
                .collect();
            let replayed: Vec<DeweyId> = seq.iter().map(|e| e.unwrap().0).collect();
            prop_assert_eq!(replayed, kept);
        }
    }
}
