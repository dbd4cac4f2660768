//! Physical layout of bracket-encoded leaf pages.
//!
//! After the common header a leaf carries:
//!
//! ```text
//! prev u64 | next u64 | data start u16 | records u16 | context offset u16 |
//! key end u16 | low key type u8 | low key len u8 | low key | value ref u16 |
//! (bracket key [value ref])* ... free ... data area | context data
//! ```
//!
//! Value references hold the distance from the context offset down to the
//! value field, so the data area can slide as one block when the context
//! data (the high key) changes size. The data area is kept compact.

use crate::primitives::bytes::fixed::{read_u16, read_u64, write_u16, write_u64};
use crate::storage::bracket::id_buffer::DeweyIdBuffer;
use crate::storage::bracket::key::{chain_len, generate_keys, BracketKey, KeyType, KEY_LEN};
use crate::storage::bracket::sequence::{NodeSequence, VALUE_REF_LEN};
use crate::storage::bracket::value::{OwnedValue, StoredValue};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{ArborError, DeweyId, Lsn, PageId, Result};

pub(crate) const PREV_PAGE: usize = 0;
pub(crate) const NEXT_PAGE: usize = 8;
pub(crate) const DATA_START: usize = 16;
pub(crate) const RECORD_COUNT: usize = 18;
pub(crate) const CONTEXT_OFFSET: usize = 20;
pub(crate) const KEY_END: usize = 22;
pub(crate) const LOW_KEY_TYPE: usize = 24;
pub(crate) const LOW_KEY_LEN: usize = 25;
/// Offset of the low key within the leaf payload.
pub const LEAF_HEADER_LEN: usize = 26;
/// Longest identifier encoding a leaf accepts, so any node can become low key.
pub const MAX_LOW_KEY_LEN: usize = u8::MAX as usize;

const MIN_PAYLOAD: usize = LEAF_HEADER_LEN + 64;

/// Location of one node in the key area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeSlot {
    pub(crate) chain_start: usize,
    pub(crate) entry: usize,
    pub(crate) end: usize,
}

impl NodeSlot {
    pub(crate) fn low(low_len: usize) -> Self {
        Self {
            chain_start: LEAF_HEADER_LEN,
            entry: LEAF_HEADER_LEN,
            end: LEAF_HEADER_LEN + low_len + VALUE_REF_LEN,
        }
    }

    /// Payload offset of the node's data key (or low key).
    pub fn offset(&self) -> usize {
        self.entry
    }

    /// True for the low key.
    pub fn is_low(&self) -> bool {
        self.entry == LEAF_HEADER_LEN
    }

    pub(crate) fn ref_offset(&self) -> usize {
        self.end - VALUE_REF_LEN
    }
}

/// Cursor state within one leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Position {
    /// In front of the low key.
    BeforeFirst,
    /// On a node.
    At(NodeSlot),
    /// Behind the last node.
    AfterLast,
}

/// Explicit position plus the identifier replayed up to it.
///
/// Offsets are only meaningful for the page state the cursor was produced
/// from; every mutation hands out a fresh cursor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafCursor {
    position: Position,
    id: Option<DeweyId>,
}

impl LeafCursor {
    /// Cursor in front of the first node.
    pub fn before_first() -> Self {
        Self {
            position: Position::BeforeFirst,
            id: None,
        }
    }

    /// Cursor behind the last node.
    pub fn after_last() -> Self {
        Self {
            position: Position::AfterLast,
            id: None,
        }
    }

    pub(crate) fn at(slot: NodeSlot, id: DeweyId) -> Self {
        Self {
            position: Position::At(slot),
            id: Some(id),
        }
    }

    /// Current position.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Identifier of the current node.
    pub fn id(&self) -> Option<&DeweyId> {
        self.id.as_ref()
    }

    /// Slot of the current node.
    pub fn slot(&self) -> Option<NodeSlot> {
        match self.position {
            Position::At(slot) => Some(slot),
            _ => None,
        }
    }

    pub(crate) fn current(&self) -> Result<(NodeSlot, &DeweyId)> {
        match (self.position, self.id.as_ref()) {
            (Position::At(slot), Some(id)) => Ok((slot, id)),
            _ => Err(ArborError::Invalid("cursor is not positioned on a node")),
        }
    }
}

/// Result of an insertion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    /// Inserted; the cursor sits on the new node.
    Inserted(LeafCursor),
    /// Not enough free space; the page is unchanged.
    NoSpace,
}

/// Result of a value update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// Replaced; carries the previous value.
    Updated(OwnedValue),
    /// Not enough free space; the page is unchanged.
    NoSpace,
}

/// Forward replay over the nodes of a leaf.
pub(crate) struct NodeScan<'p> {
    payload: &'p [u8],
    off: usize,
    end: usize,
    buffer: DeweyIdBuffer,
}

impl<'p> NodeScan<'p> {
    pub(crate) fn buffer(&self) -> &DeweyIdBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut DeweyIdBuffer {
        &mut self.buffer
    }

    /// Advances to the next node, leaving its identifier in the buffer.
    pub(crate) fn next_node(&mut self) -> Result<Option<NodeSlot>> {
        let chain_start = self.off;
        while self.off < self.end {
            let key_off = self.off;
            let key = BracketKey::decode(&self.payload[key_off..self.end])?;
            self.buffer.update(key)?;
            if key.has_data() {
                let end = key_off + KEY_LEN + VALUE_REF_LEN;
                if end > self.end {
                    return Err(ArborError::Corruption("value reference beyond key area"));
                }
                self.off = end;
                return Ok(Some(NodeSlot {
                    chain_start,
                    entry: key_off,
                    end,
                }));
            }
            self.off = key_off + KEY_LEN;
        }
        if self.off != chain_start {
            return Err(ArborError::Corruption("key area ends inside a key chain"));
        }
        Ok(None)
    }

    /// Advances and materializes the identifier.
    pub(crate) fn next_entry(&mut self) -> Result<Option<(NodeSlot, DeweyId)>> {
        match self.next_node()? {
            Some(slot) => Ok(Some((slot, self.buffer.to_id()?))),
            None => Ok(None),
        }
    }
}

/// Leaf page view over a page buffer.
#[derive(Debug)]
pub struct BracketLeaf<B> {
    page: B,
}

impl<B: AsRef<[u8]>> BracketLeaf<B> {
    /// Opens a formatted leaf.
    pub fn open(page: B) -> Result<Self> {
        let leaf = Self { page };
        check_page_len(leaf.page.as_ref().len())?;
        if page::read_kind(leaf.page.as_ref())? != PageKind::Leaf {
            return Err(ArborError::Invalid("page is not a leaf"));
        }
        leaf.check_layout()?;
        Ok(leaf)
    }

    /// Releases the underlying buffer.
    pub fn into_inner(self) -> B {
        self.page
    }

    /// Whole page bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.page.as_ref()
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.page.as_ref()[PAGE_HDR_LEN..]
    }

    /// Page id from the common header.
    pub fn page_id(&self) -> Result<PageId> {
        page::read_page_no(self.page.as_ref())
    }

    /// Page LSN.
    pub fn lsn(&self) -> Result<Lsn> {
        page::read_lsn(self.page.as_ref())
    }

    /// Left neighbour.
    pub fn prev_page(&self) -> Option<PageId> {
        PageId::from_raw(read_u64(self.payload(), PREV_PAGE))
    }

    /// Right neighbour.
    pub fn next_page(&self) -> Option<PageId> {
        PageId::from_raw(read_u64(self.payload(), NEXT_PAGE))
    }

    /// Nodes stored in the page.
    pub fn record_count(&self) -> usize {
        read_u16(self.payload(), RECORD_COUNT) as usize
    }

    /// True without nodes.
    pub fn is_empty(&self) -> bool {
        self.payload()[LOW_KEY_TYPE] == 0
    }

    /// Bytes between the key area and the data area.
    pub fn free_space(&self) -> usize {
        self.data_start() - self.key_end()
    }

    /// Bytes available to keys and values in an empty page with the same
    /// context data.
    pub fn usable_space(&self) -> usize {
        self.context_offset() - LEAF_HEADER_LEN
    }

    /// Bytes used by keys and values.
    pub fn used_space(&self) -> usize {
        self.usable_space() - self.free_space()
    }

    pub(crate) fn data_start(&self) -> usize {
        read_u16(self.payload(), DATA_START) as usize
    }

    pub(crate) fn context_offset(&self) -> usize {
        read_u16(self.payload(), CONTEXT_OFFSET) as usize
    }

    pub(crate) fn key_end(&self) -> usize {
        read_u16(self.payload(), KEY_END) as usize
    }

    pub(crate) fn low_len(&self) -> usize {
        self.payload()[LOW_KEY_LEN] as usize
    }

    /// Type of the low node, `None` for an empty page.
    pub fn low_key_type(&self) -> Result<Option<KeyType>> {
        match self.payload()[LOW_KEY_TYPE] {
            0 => Ok(None),
            t if t == KeyType::Data as u8 => Ok(Some(KeyType::Data)),
            t if t == KeyType::Attribute as u8 => Ok(Some(KeyType::Attribute)),
            _ => Err(ArborError::Corruption("invalid low key type")),
        }
    }

    /// First identifier of the page.
    pub fn low_key(&self) -> Result<Option<DeweyId>> {
        if self.is_empty() {
            return Ok(None);
        }
        let bytes = &self.payload()[LEAF_HEADER_LEN..LEAF_HEADER_LEN + self.low_len()];
        DeweyId::from_bytes(bytes).map(Some)
    }

    /// Exclusive upper bound of the page (low key of the right neighbour).
    pub fn high_key(&self) -> Result<Option<DeweyId>> {
        let payload = self.payload();
        let ctx = self.context_offset();
        let len = payload[ctx] as usize;
        if len == 0 {
            return Ok(None);
        }
        let bytes = payload
            .get(ctx + 1..ctx + 1 + len)
            .ok_or(ArborError::Corruption("high key beyond page end"))?;
        DeweyId::from_bytes(bytes).map(Some)
    }

    fn context_len(&self) -> usize {
        1 + self.payload()[self.context_offset()] as usize
    }

    /// Slot of the low key.
    pub fn first_slot(&self) -> Option<NodeSlot> {
        if self.is_empty() {
            None
        } else {
            Some(NodeSlot::low(self.low_len()))
        }
    }

    /// Replay positioned on the low key.
    pub(crate) fn scan(&self) -> Result<Option<(NodeScan<'_>, NodeSlot)>> {
        let Some(low) = self.low_key()? else {
            return Ok(None);
        };
        let slot = NodeSlot::low(self.low_len());
        Ok(Some((self.scan_after(slot, &low), slot)))
    }

    /// Replay continuing behind `slot`, whose identifier is `id`.
    pub(crate) fn scan_after(&self, slot: NodeSlot, id: &DeweyId) -> NodeScan<'_> {
        NodeScan {
            payload: self.payload(),
            off: slot.end,
            end: self.key_end(),
            buffer: DeweyIdBuffer::from_id(id),
        }
    }

    /// Last node of the page.
    pub fn last_node(&self) -> Result<Option<(NodeSlot, DeweyId)>> {
        let Some((mut scan, slot)) = self.scan()? else {
            return Ok(None);
        };
        let mut last = slot;
        while let Some(next) = scan.next_node()? {
            last = next;
        }
        Ok(Some((last, scan.buffer().to_id()?)))
    }

    /// Node following `slot`.
    pub fn node_after(&self, slot: NodeSlot, id: &DeweyId) -> Result<Option<(NodeSlot, DeweyId)>> {
        self.scan_after(slot, id).next_entry()
    }

    /// Value stored for the node at `slot`.
    pub fn value_at(&self, slot: NodeSlot) -> Result<StoredValue<'_>> {
        let entry = self.value_entry(slot.ref_offset())?;
        let payload = self.payload();
        let (value, _) = StoredValue::decode(&payload[entry..self.context_offset()])?;
        Ok(value)
    }

    /// Value under a cursor.
    pub fn value(&self, cursor: &LeafCursor) -> Result<StoredValue<'_>> {
        let (slot, _) = cursor.current()?;
        self.value_at(slot)
    }

    fn value_entry(&self, ref_off: usize) -> Result<usize> {
        let ctx = self.context_offset();
        let dist = read_u16(self.payload(), ref_off) as usize;
        let entry = ctx
            .checked_sub(dist)
            .ok_or(ArborError::Corruption("value reference before data area"))?;
        if dist == 0 || entry < self.data_start() {
            return Err(ArborError::Corruption("value reference outside data area"));
        }
        Ok(entry)
    }

    fn value_field_at(&self, dist: usize) -> Result<(usize, usize)> {
        let ctx = self.context_offset();
        let entry = ctx
            .checked_sub(dist)
            .filter(|&entry| dist != 0 && entry >= self.data_start())
            .ok_or(ArborError::Corruption("value reference outside data area"))?;
        let (_, len) = StoredValue::decode(&self.payload()[entry..ctx])?;
        Ok((entry, len))
    }

    pub(crate) fn value_field_len(&self, ref_off: usize) -> Result<(usize, usize)> {
        let entry = self.value_entry(ref_off)?;
        let (_, len) = StoredValue::decode(&self.payload()[entry..self.context_offset()])?;
        Ok((entry, len))
    }

    /// Offsets of every value reference, in key order.
    pub(crate) fn value_refs(&self) -> Result<Vec<usize>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let keys = &self.payload()[LEAF_HEADER_LEN..self.key_end()];
        let mut refs = refs_in(keys, self.low_len())?;
        for off in refs.iter_mut() {
            *off += LEAF_HEADER_LEN;
        }
        Ok(refs)
    }

    /// All nodes with owned values, in order.
    pub fn entries(&self) -> Result<Vec<(DeweyId, OwnedValue)>> {
        let mut out = Vec::with_capacity(self.record_count());
        let Some((mut scan, slot)) = self.scan()? else {
            return Ok(out);
        };
        out.push((scan.buffer().to_id()?, self.value_at(slot)?.to_owned_value()));
        while let Some(slot) = scan.next_node()? {
            out.push((scan.buffer().to_id()?, self.value_at(slot)?.to_owned_value()));
        }
        Ok(out)
    }

    /// Copies the nodes from `slot` (identifier `id`) to the page end.
    pub fn extract_sequence(&self, slot: NodeSlot, id: &DeweyId) -> Result<NodeSequence> {
        let mut seq = NodeSequence::from_node(id, self.value_at(slot)?)?;
        let mut scan = self.scan_after(slot, id);
        while let Some((next, next_id)) = scan.next_entry()? {
            seq.push(&next_id, self.value_at(next)?)?;
        }
        Ok(seq)
    }

    /// Full structural check: ascending identifiers inside the high key,
    /// matching record count, every reference inside a compact data area.
    pub fn check(&self) -> Result<()> {
        self.check_layout()?;
        let high = self.high_key()?;
        let mut count = 0usize;
        let mut data_bytes = 0usize;
        if let Some((mut scan, slot)) = self.scan()? {
            let mut previous: Option<DeweyId> = None;
            let mut slot = Some(slot);
            while let Some(current) = slot {
                let id = scan.buffer().to_id()?;
                if previous.as_ref().map_or(false, |p| p >= &id) {
                    return Err(ArborError::Corruption("leaf identifiers not ascending"));
                }
                if high.as_ref().map_or(false, |h| &id >= h) {
                    return Err(ArborError::Corruption("leaf identifier at or above high key"));
                }
                data_bytes += self.value_field_len(current.ref_offset())?.1;
                count += 1;
                previous = Some(id);
                slot = scan.next_node()?;
            }
        }
        if count != self.record_count() {
            return Err(ArborError::Corruption("leaf record count mismatch"));
        }
        if data_bytes != self.context_offset() - self.data_start() {
            return Err(ArborError::Corruption("leaf data area not compact"));
        }
        Ok(())
    }

    fn check_layout(&self) -> Result<()> {
        let payload = self.payload();
        let key_end = self.key_end();
        let data_start = self.data_start();
        let ctx = self.context_offset();
        if !(LEAF_HEADER_LEN <= key_end && key_end <= data_start && data_start <= ctx && ctx < payload.len()) {
            return Err(ArborError::Corruption("leaf area offsets out of order"));
        }
        if ctx + 1 + payload[ctx] as usize != payload.len() {
            return Err(ArborError::Corruption("leaf context data does not end at page end"));
        }
        match self.low_key_type()? {
            None if key_end != LEAF_HEADER_LEN || self.record_count() != 0 => {
                Err(ArborError::Corruption("empty leaf carries keys"))
            }
            Some(_) if key_end < LEAF_HEADER_LEN + self.low_len() + VALUE_REF_LEN => {
                Err(ArborError::Corruption("leaf low key beyond key area"))
            }
            _ => Ok(()),
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BracketLeaf<B> {
    /// Formats `page` as an empty leaf, keeping an existing page LSN.
    pub fn format(mut page: B, page_id: PageId) -> Result<Self> {
        let len = page.as_ref().len();
        check_page_len(len)?;
        let lsn = PageHeader::decode(page.as_ref())
            .map(|hdr| hdr.lsn)
            .unwrap_or(Lsn(0));
        let bytes = page.as_mut();
        bytes.fill(0);
        PageHeader::new(page_id, PageKind::Leaf, len as u32)?
            .with_lsn(lsn)
            .encode(bytes)?;
        let mut leaf = Self { page };
        let ctx = leaf.payload().len() - 1;
        let payload = leaf.payload_mut();
        write_u16(payload, CONTEXT_OFFSET, ctx as u16);
        write_u16(payload, DATA_START, ctx as u16);
        write_u16(payload, KEY_END, LEAF_HEADER_LEN as u16);
        Ok(leaf)
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.page.as_mut()[PAGE_HDR_LEN..]
    }

    /// Stores a new page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) -> Result<()> {
        page::write_lsn(self.page.as_mut(), lsn)
    }

    /// Sets the left neighbour.
    pub fn set_prev_page(&mut self, page: Option<PageId>) {
        write_u64(self.payload_mut(), PREV_PAGE, PageId::to_raw(page));
    }

    /// Sets the right neighbour.
    pub fn set_next_page(&mut self, page: Option<PageId>) {
        write_u64(self.payload_mut(), NEXT_PAGE, PageId::to_raw(page));
    }

    pub(crate) fn set_record_count(&mut self, count: usize) -> Result<()> {
        let count = u16::try_from(count).map_err(|_| ArborError::Corruption("leaf record count overflow"))?;
        write_u16(self.payload_mut(), RECORD_COUNT, count);
        Ok(())
    }

    pub(crate) fn set_low(&mut self, low: Option<&DeweyId>, len: usize) {
        let kind = match low {
            None => 0,
            Some(id) if id.is_attribute() => KeyType::Attribute as u8,
            Some(_) => KeyType::Data as u8,
        };
        let payload = self.payload_mut();
        payload[LOW_KEY_TYPE] = kind;
        payload[LOW_KEY_LEN] = len as u8;
    }

    /// Replaces the high key. Returns false when the context data does not
    /// fit, leaving the page unchanged.
    pub fn set_high_key(&mut self, high: Option<&DeweyId>) -> Result<bool> {
        let bytes = high.map(DeweyId::to_bytes).unwrap_or_default();
        if bytes.len() > MAX_LOW_KEY_LEN {
            return Err(ArborError::Invalid("high key longer than 255 bytes"));
        }
        let old_len = self.context_len();
        let new_len = 1 + bytes.len();
        if new_len > old_len && new_len - old_len > self.free_space() {
            return Ok(false);
        }
        let ctx = self.context_offset();
        let data_start = self.data_start();
        let payload_len = self.payload().len();
        let new_ctx = payload_len - new_len;
        let new_data_start = data_start + new_ctx - ctx;
        let payload = self.payload_mut();
        payload.copy_within(data_start..ctx, new_data_start);
        payload[new_ctx] = bytes.len() as u8;
        payload[new_ctx + 1..].copy_from_slice(&bytes);
        write_u16(payload, CONTEXT_OFFSET, new_ctx as u16);
        write_u16(payload, DATA_START, new_data_start as u16);
        if new_data_start > data_start {
            let key_end = self.key_end();
            self.payload_mut()[key_end..new_data_start].fill(0);
        }
        Ok(true)
    }

    /// Inserts `id` behind the cursor position. `BeforeFirst` inserts a new
    /// low key; `AfterLast` appends.
    pub fn insert_after(
        &mut self,
        cursor: &LeafCursor,
        id: &DeweyId,
        value: StoredValue<'_>,
    ) -> Result<InsertOutcome> {
        value.check()?;
        let low_bytes = id.to_bytes();
        if low_bytes.len() > MAX_LOW_KEY_LEN {
            return Err(ArborError::Invalid("identifier encoding longer than 255 bytes"));
        }
        let mut repl = Vec::new();
        let (start, remove_end, ref_at, becomes_low) = if self.is_empty() {
            repl.extend_from_slice(&low_bytes);
            let ref_at = repl.len();
            repl.extend_from_slice(&[0, 0]);
            (LEAF_HEADER_LEN, LEAF_HEADER_LEN, ref_at, true)
        } else {
            let anchor = match cursor.position() {
                Position::BeforeFirst => None,
                Position::At(slot) => Some((slot, cursor.current()?.1.clone())),
                Position::AfterLast => self.last_node()?,
            };
            match anchor {
                None => {
                    let old_low = self
                        .low_key()?
                        .ok_or(ArborError::Corruption("non-empty leaf without low key"))?;
                    if id >= &old_low {
                        return Err(ArborError::Invalid("new low key must precede the current one"));
                    }
                    repl.extend_from_slice(&low_bytes);
                    let ref_at = repl.len();
                    repl.extend_from_slice(&[0, 0]);
                    for key in generate_keys(id, &old_low)? {
                        repl.extend_from_slice(&key.encode());
                    }
                    (LEAF_HEADER_LEN, LEAF_HEADER_LEN + self.low_len(), ref_at, true)
                }
                Some((slot, current)) => {
                    if id <= &current {
                        return Err(ArborError::Invalid("inserted identifier must follow the cursor"));
                    }
                    let next = self.node_after(slot, &current)?;
                    for key in generate_keys(&current, id)? {
                        repl.extend_from_slice(&key.encode());
                    }
                    let ref_at = repl.len();
                    repl.extend_from_slice(&[0, 0]);
                    let remove_end = match &next {
                        Some((next_slot, next_id)) => {
                            if id >= next_id {
                                return Err(ArborError::Invalid(
                                    "inserted identifier must precede the following node",
                                ));
                            }
                            for key in generate_keys(id, next_id)? {
                                repl.extend_from_slice(&key.encode());
                            }
                            next_slot.entry + KEY_LEN
                        }
                        None => slot.end,
                    };
                    (slot.end, remove_end, ref_at, false)
                }
            }
        };

        let value_len = value.encoded_len();
        let removed = remove_end - start;
        let grow = repl.len().saturating_sub(removed);
        if grow + value_len > self.free_space() {
            return Ok(InsertOutcome::NoSpace);
        }

        let ctx = self.context_offset();
        let new_data_start = self.data_start() - value_len;
        value.write_to(&mut self.payload_mut()[new_data_start..new_data_start + value_len]);
        write_u16(self.payload_mut(), DATA_START, new_data_start as u16);
        repl[ref_at..ref_at + VALUE_REF_LEN].copy_from_slice(&((ctx - new_data_start) as u16).to_be_bytes());
        self.splice_keys(start, remove_end, &repl);
        self.set_record_count(self.record_count() + 1)?;

        let slot = if becomes_low {
            self.set_low(Some(id), low_bytes.len());
            NodeSlot::low(low_bytes.len())
        } else {
            let entry = start + ref_at - KEY_LEN;
            NodeSlot {
                chain_start: start,
                entry,
                end: entry + KEY_LEN + VALUE_REF_LEN,
            }
        };
        Ok(InsertOutcome::Inserted(LeafCursor::at(slot, id.clone())))
    }

    /// Bytes an insertion of `id` with `value` behind `cursor` would consume.
    pub fn insert_cost(&self, cursor: &LeafCursor, id: &DeweyId, value: StoredValue<'_>) -> Result<usize> {
        let keys = match (cursor.position(), cursor.id()) {
            _ if self.is_empty() => id.encoded_len() + VALUE_REF_LEN,
            (Position::At(_), Some(current)) => {
                chain_len(&generate_keys(current, id)?) + VALUE_REF_LEN
            }
            _ => id.encoded_len() + VALUE_REF_LEN + KEY_LEN,
        };
        Ok(keys + value.encoded_len())
    }

    /// Replaces the value of the node under the cursor.
    pub fn set_value(&mut self, cursor: &LeafCursor, value: StoredValue<'_>) -> Result<UpdateOutcome> {
        value.check()?;
        let (slot, _) = cursor.current()?;
        let (_, old_len) = self.value_field_len(slot.ref_offset())?;
        let new_len = value.encoded_len();
        if new_len > old_len && new_len - old_len > self.free_space() {
            return Ok(UpdateOutcome::NoSpace);
        }
        let previous = self.value_at(slot)?.to_owned_value();
        let mut field = Vec::with_capacity(new_len);
        value.encode_into(&mut field);
        self.rewrite_data_area(Some((slot.ref_offset(), field)))?;
        Ok(UpdateOutcome::Updated(previous))
    }

    /// Appends a node sequence behind the last node. Returns false when it
    /// does not fit, leaving the page unchanged.
    pub fn append_sequence(&mut self, seq: &NodeSequence) -> Result<bool> {
        let Some(seq_low) = seq.low_key() else {
            return Ok(true);
        };
        let low_bytes = seq_low.to_bytes();
        if low_bytes.len() > MAX_LOW_KEY_LEN {
            return Err(ArborError::Invalid("identifier encoding longer than 255 bytes"));
        }
        let was_empty = self.is_empty();
        let mut keys = Vec::with_capacity(seq.page_len());
        if was_empty {
            keys.extend_from_slice(&low_bytes);
        } else {
            let (_, last) = self
                .last_node()?
                .ok_or(ArborError::Corruption("non-empty leaf without nodes"))?;
            for key in generate_keys(&last, seq_low)? {
                keys.extend_from_slice(&key.encode());
            }
        }
        let mut values = Vec::with_capacity(seq.number_of_data_records());
        for entry in seq.raw_entries() {
            let entry = entry?;
            if let Some(key) = entry.key {
                keys.extend_from_slice(&key.encode());
            }
            if let Some(value) = entry.value {
                values.push((keys.len(), value));
                keys.extend_from_slice(&[0, 0]);
            }
        }
        let value_bytes: usize = values.iter().map(|(_, v)| v.encoded_len()).sum();
        if keys.len() + value_bytes > self.free_space() {
            return Ok(false);
        }
        let ctx = self.context_offset();
        let mut data_start = self.data_start();
        for (ref_at, value) in &values {
            let len = value.encoded_len();
            data_start -= len;
            value.write_to(&mut self.payload_mut()[data_start..data_start + len]);
            keys[*ref_at..*ref_at + VALUE_REF_LEN].copy_from_slice(&((ctx - data_start) as u16).to_be_bytes());
        }
        write_u16(self.payload_mut(), DATA_START, data_start as u16);
        let key_end = self.key_end();
        self.splice_keys(key_end, key_end, &keys);
        self.set_record_count(self.record_count() + seq.number_of_data_records())?;
        if was_empty {
            self.set_low(Some(seq_low), low_bytes.len());
        }
        Ok(true)
    }

    /// Drops every node from `slot` on and compacts the data area.
    pub(crate) fn truncate_from(&mut self, slot: NodeSlot, removed: usize) -> Result<()> {
        let keys = self.payload()[LEAF_HEADER_LEN..slot.chain_start].to_vec();
        let low = if slot.is_low() {
            None
        } else {
            self.low_key()?
        };
        if !self.relayout(keys, low.as_ref(), self.record_count() - removed)? {
            return Err(ArborError::Corruption("truncated leaf outgrew its page"));
        }
        Ok(())
    }

    /// Installs a new key area (starting with the low key) whose value
    /// references still point into the current data area, then rebuilds the
    /// data area compactly. Returns false, writing nothing, when the result
    /// does not fit.
    pub(crate) fn relayout(&mut self, keys: Vec<u8>, low: Option<&DeweyId>, records: usize) -> Result<bool> {
        let low_len = low.map_or(0, DeweyId::encoded_len);
        let refs = match low {
            Some(_) => refs_in(&keys, low_len)?,
            None if keys.is_empty() => Vec::new(),
            None => return Err(ArborError::Corruption("key area without low key")),
        };
        if refs.len() != records {
            return Err(ArborError::Corruption("relayout record count mismatch"));
        }
        let mut fields = Vec::with_capacity(refs.len());
        for &ref_off in &refs {
            let dist = read_u16(&keys, ref_off) as usize;
            let (entry, len) = self.value_field_at(dist)?;
            fields.push(self.payload()[entry..entry + len].to_vec());
        }
        let ctx = self.context_offset();
        let total: usize = fields.iter().map(Vec::len).sum();
        if LEAF_HEADER_LEN + keys.len() + total > ctx {
            return Ok(false);
        }
        let key_end = LEAF_HEADER_LEN + keys.len();
        let mut keys = keys;
        let mut cursor = ctx;
        let payload = self.payload_mut();
        for (ref_off, field) in refs.iter().zip(&fields) {
            cursor -= field.len();
            payload[cursor..cursor + field.len()].copy_from_slice(field);
            write_u16(&mut keys, *ref_off, (ctx - cursor) as u16);
        }
        payload[LEAF_HEADER_LEN..key_end].copy_from_slice(&keys);
        payload[key_end..cursor].fill(0);
        write_u16(payload, KEY_END, key_end as u16);
        write_u16(payload, DATA_START, cursor as u16);
        self.set_record_count(records)?;
        self.set_low(low, low_len);
        Ok(true)
    }

    /// Replaces `[start, end)` of the key area with `repl`.
    pub(crate) fn splice_keys(&mut self, start: usize, end: usize, repl: &[u8]) {
        let key_end = self.key_end();
        let new_end = key_end - (end - start) + repl.len();
        let payload = self.payload_mut();
        payload.copy_within(end..key_end, start + repl.len());
        payload[start..start + repl.len()].copy_from_slice(repl);
        if new_end < key_end {
            payload[new_end..key_end].fill(0);
        }
        write_u16(payload, KEY_END, new_end as u16);
    }

    /// Rewrites the data area compactly in key order, optionally replacing
    /// the field referenced from `replace.0`.
    pub(crate) fn rewrite_data_area(&mut self, replace: Option<(usize, Vec<u8>)>) -> Result<()> {
        let refs = self.value_refs()?;
        let mut fields = Vec::with_capacity(refs.len());
        for &ref_off in &refs {
            match &replace {
                Some((target, field)) if *target == ref_off => fields.push(field.clone()),
                _ => {
                    let (entry, len) = self.value_field_len(ref_off)?;
                    fields.push(self.payload()[entry..entry + len].to_vec());
                }
            }
        }
        let ctx = self.context_offset();
        let key_end = self.key_end();
        let total: usize = fields.iter().map(Vec::len).sum();
        if key_end + total > ctx {
            return Err(ArborError::Corruption("leaf data area overflows key area"));
        }
        let payload = self.payload_mut();
        let mut cursor = ctx;
        for (ref_off, field) in refs.iter().zip(&fields) {
            cursor -= field.len();
            payload[cursor..cursor + field.len()].copy_from_slice(field);
            write_u16(payload, *ref_off, (ctx - cursor) as u16);
        }
        payload[key_end..cursor].fill(0);
        write_u16(payload, DATA_START, cursor as u16);
        Ok(())
    }
}

/// Offsets of the value references in a key area starting with a low key of
/// `low_len` bytes.
pub(crate) fn refs_in(keys: &[u8], low_len: usize) -> Result<Vec<usize>> {
    let mut refs = Vec::new();
    let mut off = low_len;
    if off + VALUE_REF_LEN > keys.len() {
        return Err(ArborError::Corruption("low key beyond key area"));
    }
    refs.push(off);
    off += VALUE_REF_LEN;
    while off < keys.len() {
        let key = BracketKey::decode(&keys[off..])?;
        off += KEY_LEN;
        if key.has_data() {
            refs.push(off);
            off += VALUE_REF_LEN;
        }
    }
    if off != keys.len() {
        return Err(ArborError::Corruption("value reference beyond key area"));
    }
    Ok(refs)
}

fn check_page_len(len: usize) -> Result<()> {
    if len < PAGE_HDR_LEN + MIN_PAYLOAD {
        return Err(ArborError::Invalid("page too small for a leaf"));
    }
    if len - PAGE_HDR_LEN > u16::MAX as usize {
        return Err(ArborError::Invalid("page too large for 16-bit leaf offsets"));
    }
    Ok(())
}
