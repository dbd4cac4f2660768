//! Physical layout of branch pages.
//!
//! The payload header holds the slot count, the free-space bounds and the low
//! child. Records (`flags | key len | key | value len | value`) grow up from
//! the header while the `(offset, len)` slot directory grows down from the
//! page end, kept in separator order.

use std::cmp::Ordering;

use crate::primitives::bytes::fixed::{read_u16, read_u64, write_u16, write_u64};
use crate::storage::bracket::value::{OwnedValue, StoredValue};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{ArborError, DeweyId, Lsn, PageId, Result};

/// Number of bytes used by the branch payload header.
pub const BRANCH_HEADER_LEN: usize = 14;

const NSLOTS_OFFSET: usize = 0;
const FREE_START_OFFSET: usize = 2;
const FREE_END_OFFSET: usize = 4;
const LOW_CHILD_OFFSET: usize = 6;

/// Size in bytes of a single slot directory entry (offset + length).
pub const SLOT_ENTRY_LEN: usize = 4;

/// Record header bytes besides key and value (`flags | key len | value len`).
pub const RECORD_OVERHEAD: usize = 5;

/// Flag bit marking an externalized value.
pub const FLAG_EXTERNAL: u8 = 0x01;

const PAGE_ID_LEN: usize = 8;

/// Outcome of [`BranchPage::insert`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BranchInsert {
    /// Stored at the given slot index.
    Inserted(usize),
    /// Not enough free space; the page is unchanged.
    NoSpace,
}

/// Outcome of [`BranchPage::set_value`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BranchUpdate {
    /// Replaced; carries the previous value.
    Updated(OwnedValue),
    /// Not enough free space; the page is unchanged.
    NoSpace,
}

/// Header metadata decoded from the payload of a branch page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Number of records in the slot directory
    pub slot_count: u16,
    /// Offset to the start of free space in the payload
    pub free_start: u16,
    /// Offset to the end of free space in the payload
    pub free_end: u16,
    /// Child for keys below the first separator
    pub low_child: Option<PageId>,
}

impl Header {
    /// Decodes and validates the header of `payload`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < BRANCH_HEADER_LEN {
            return Err(ArborError::Corruption("branch payload shorter than header"));
        }
        let slot_count = read_u16(payload, NSLOTS_OFFSET);
        let free_start = read_u16(payload, FREE_START_OFFSET);
        let free_end = read_u16(payload, FREE_END_OFFSET);
        let low_child = PageId::from_raw(read_u64(payload, LOW_CHILD_OFFSET));
        if (free_start as usize) < BRANCH_HEADER_LEN || free_start > free_end {
            return Err(ArborError::Corruption("branch free space pointers out of order"));
        }
        let slot_bytes = slot_count as usize * SLOT_ENTRY_LEN;
        if free_end as usize + slot_bytes != payload.len() {
            return Err(ArborError::Corruption("branch free_end does not meet slot directory"));
        }
        Ok(Self {
            slot_count,
            free_start,
            free_end,
            low_child,
        })
    }
}

/// Reference to one record stored on the page.
#[derive(Copy, Clone, Debug)]
pub struct BranchRecordRef<'a> {
    /// Encoded separator.
    pub key: &'a [u8],
    /// Stored value.
    pub value: StoredValue<'a>,
}

fn decode_record(buf: &[u8]) -> Result<BranchRecordRef<'_>> {
    if buf.len() < RECORD_OVERHEAD {
        return Err(ArborError::Corruption("branch record shorter than header"));
    }
    let flags = buf[0];
    let key_len = read_u16(buf, 1) as usize;
    let key_end = 3 + key_len;
    if buf.len() < key_end + 2 {
        return Err(ArborError::Corruption("branch record key truncated"));
    }
    let value_len = read_u16(buf, key_end) as usize;
    let value_start = key_end + 2;
    if buf.len() != value_start + value_len {
        return Err(ArborError::Corruption("branch record length mismatch"));
    }
    let raw = &buf[value_start..];
    let value = if flags & FLAG_EXTERNAL != 0 {
        if raw.len() != PAGE_ID_LEN {
            return Err(ArborError::Corruption("externalized branch value is not a page id"));
        }
        StoredValue::External(PageId(read_u64(raw, 0)))
    } else {
        StoredValue::Inline(raw)
    };
    Ok(BranchRecordRef {
        key: &buf[3..key_end],
        value,
    })
}

/// Encodes a record into `dst`.
pub fn encode_record(key: &[u8], value: StoredValue<'_>, dst: &mut Vec<u8>) -> Result<()> {
    let key_len = u16::try_from(key.len()).map_err(|_| ArborError::Invalid("separator too long"))?;
    match value {
        StoredValue::Inline(bytes) => {
            let len = u16::try_from(bytes.len()).map_err(|_| ArborError::Invalid("branch value too long"))?;
            dst.push(0);
            dst.extend_from_slice(&key_len.to_be_bytes());
            dst.extend_from_slice(key);
            dst.extend_from_slice(&len.to_be_bytes());
            dst.extend_from_slice(bytes);
        }
        StoredValue::External(page) => {
            dst.push(FLAG_EXTERNAL);
            dst.extend_from_slice(&key_len.to_be_bytes());
            dst.extend_from_slice(key);
            dst.extend_from_slice(&(PAGE_ID_LEN as u16).to_be_bytes());
            dst.extend_from_slice(&page.0.to_be_bytes());
        }
    }
    Ok(())
}

/// Bytes a record with `key` and `value` occupies, slot entry included.
pub fn record_cost(key: &[u8], value: StoredValue<'_>) -> usize {
    let value_len = match value {
        StoredValue::Inline(bytes) => bytes.len(),
        StoredValue::External(_) => PAGE_ID_LEN,
    };
    RECORD_OVERHEAD + key.len() + value_len + SLOT_ENTRY_LEN
}

/// Slotted page of `(separator, value)` records plus a low child pointer.
#[derive(Debug)]
pub struct BranchPage<B> {
    page: B,
}

impl<B: AsRef<[u8]>> BranchPage<B> {
    /// Opens a formatted branch page.
    pub fn open(page: B) -> Result<Self> {
        if page.as_ref().len() <= PAGE_HDR_LEN + BRANCH_HEADER_LEN {
            return Err(ArborError::Invalid("page too small for a branch"));
        }
        if page::read_kind(page.as_ref())? != PageKind::Branch {
            return Err(ArborError::Invalid("page is not a branch"));
        }
        let branch = Self { page };
        branch.header()?;
        Ok(branch)
    }

    /// Releases the underlying buffer.
    pub fn into_inner(self) -> B {
        self.page
    }

    /// Whole page bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.page.as_ref()
    }

    fn payload(&self) -> &[u8] {
        &self.page.as_ref()[PAGE_HDR_LEN..]
    }

    /// Decoded header.
    pub fn header(&self) -> Result<Header> {
        Header::parse(self.payload())
    }

    /// Page id from the common header.
    pub fn page_id(&self) -> Result<PageId> {
        page::read_page_no(self.page.as_ref())
    }

    /// Page LSN.
    pub fn lsn(&self) -> Result<Lsn> {
        page::read_lsn(self.page.as_ref())
    }

    /// Child for keys below the first separator.
    pub fn low_child(&self) -> Option<PageId> {
        PageId::from_raw(read_u64(self.payload(), LOW_CHILD_OFFSET))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        read_u16(self.payload(), NSLOTS_OFFSET) as usize
    }

    /// True without records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes between the record area and the slot directory.
    pub fn free_space(&self) -> usize {
        let payload = self.payload();
        (read_u16(payload, FREE_END_OFFSET) - read_u16(payload, FREE_START_OFFSET)) as usize
    }

    /// Bytes available to records in an empty page.
    pub fn usable_space(&self) -> usize {
        self.payload().len() - BRANCH_HEADER_LEN
    }

    fn extent(&self, idx: usize) -> Result<(usize, usize)> {
        let count = self.len();
        if idx >= count {
            return Err(ArborError::Invalid("slot index out of range"));
        }
        let payload = self.payload();
        let pos = payload.len() - (count - idx) * SLOT_ENTRY_LEN;
        let start = read_u16(payload, pos) as usize;
        let len = read_u16(payload, pos + 2) as usize;
        let end = start + len;
        if start < BRANCH_HEADER_LEN || end > read_u16(payload, FREE_START_OFFSET) as usize {
            return Err(ArborError::Corruption("branch record extent out of range"));
        }
        Ok((start, end))
    }

    /// Record at slot `idx`.
    pub fn record(&self, idx: usize) -> Result<BranchRecordRef<'_>> {
        let (start, end) = self.extent(idx)?;
        decode_record(&self.payload()[start..end])
    }

    /// Separator at slot `idx`.
    pub fn key_at(&self, idx: usize) -> Result<DeweyId> {
        DeweyId::from_bytes(self.record(idx)?.key)
    }

    /// Value at slot `idx`.
    pub fn value_at(&self, idx: usize) -> Result<StoredValue<'_>> {
        Ok(self.record(idx)?.value)
    }

    /// Value at slot `idx` read as a child page id.
    pub fn child_at(&self, idx: usize) -> Result<PageId> {
        match self.value_at(idx)? {
            StoredValue::Inline(bytes) if bytes.len() == PAGE_ID_LEN => Ok(PageId(read_u64(bytes, 0))),
            _ => Err(ArborError::Corruption("branch value is not a child pointer")),
        }
    }

    /// Binary search over the encoded separators. `Ok` holds the index of an
    /// equal separator, `Err` the insertion index.
    pub fn position(&self, key: &DeweyId) -> Result<std::result::Result<usize, usize>> {
        let needle = key.to_bytes();
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.record(mid)?.key.cmp(needle.as_slice()) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of the greatest separator `<= key`, `None` when every separator
    /// is greater. A separator equal to the key routes right.
    pub fn floor_index(&self, key: &DeweyId) -> Result<Option<usize>> {
        Ok(match self.position(key)? {
            Ok(idx) => Some(idx),
            Err(0) => None,
            Err(idx) => Some(idx - 1),
        })
    }

    fn child_for(&self, idx: Option<usize>) -> Result<Option<PageId>> {
        match idx {
            Some(idx) => self.child_at(idx).map(Some),
            None => Ok(self.low_child()),
        }
    }

    /// Child whose key range holds `key`.
    pub fn search(&self, key: &DeweyId) -> Result<Option<PageId>> {
        self.child_for(self.floor_index(key)?)
    }

    /// Child to the right of the one [`BranchPage::search`] returns.
    pub fn search_next_page_id(&self, key: &DeweyId) -> Result<Option<PageId>> {
        let next = match self.floor_index(key)? {
            Some(idx) => idx + 1,
            None => 0,
        };
        if next < self.len() {
            self.child_at(next).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Child of the rightmost separator that is `key` or lies in its
    /// subtree; falls back to [`BranchPage::search`] when none does.
    pub fn find_greatest_inside(&self, key: &DeweyId) -> Result<Option<PageId>> {
        let start = match self.position(key)? {
            Ok(idx) | Err(idx) => idx,
        };
        let mut inside = None;
        for idx in start..self.len() {
            let separator = self.key_at(idx)?;
            if key.is_ancestor_or_self_of(&separator) {
                inside = Some(idx);
            } else {
                break;
            }
        }
        match inside {
            Some(idx) => self.child_at(idx).map(Some),
            None => self.search(key),
        }
    }

    /// All records with owned values.
    pub fn entries(&self) -> Result<Vec<(DeweyId, OwnedValue)>> {
        (0..self.len())
            .map(|idx| {
                let record = self.record(idx)?;
                Ok((DeweyId::from_bytes(record.key)?, record.value.to_owned_value()))
            })
            .collect()
    }

    /// Structural check: strictly ascending separators, no overlapping records.
    pub fn check(&self) -> Result<()> {
        let header = self.header()?;
        let mut used = BRANCH_HEADER_LEN;
        let mut previous: Option<&[u8]> = None;
        for idx in 0..self.len() {
            let (start, end) = self.extent(idx)?;
            used += end - start;
            let record = self.record(idx)?;
            DeweyId::from_bytes(record.key)?;
            if previous.map_or(false, |p| p >= record.key) {
                return Err(ArborError::Corruption("branch separators not ascending"));
            }
            previous = Some(record.key);
        }
        if used != header.free_start as usize {
            return Err(ArborError::Corruption("branch record area has holes"));
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BranchPage<B> {
    /// Formats `page` as an empty branch, keeping an existing page LSN.
    pub fn format(mut page: B, page_id: PageId, low_child: Option<PageId>) -> Result<Self> {
        let len = page.as_ref().len();
        if len <= PAGE_HDR_LEN + BRANCH_HEADER_LEN || len - PAGE_HDR_LEN > u16::MAX as usize {
            return Err(ArborError::Invalid("page size unsuitable for a branch"));
        }
        let lsn = PageHeader::decode(page.as_ref())
            .map(|hdr| hdr.lsn)
            .unwrap_or(Lsn(0));
        let bytes = page.as_mut();
        bytes.fill(0);
        PageHeader::new(page_id, PageKind::Branch, len as u32)?
            .with_lsn(lsn)
            .encode(bytes)?;
        let mut branch = Self { page };
        let payload_len = branch.payload().len();
        let payload = branch.payload_mut();
        write_u16(payload, FREE_START_OFFSET, BRANCH_HEADER_LEN as u16);
        write_u16(payload, FREE_END_OFFSET, payload_len as u16);
        write_u64(payload, LOW_CHILD_OFFSET, PageId::to_raw(low_child));
        Ok(branch)
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.page.as_mut()[PAGE_HDR_LEN..]
    }

    /// Stores a new page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) -> Result<()> {
        page::write_lsn(self.page.as_mut(), lsn)
    }

    /// Sets the low child pointer.
    pub fn set_low_child(&mut self, child: Option<PageId>) {
        write_u64(self.payload_mut(), LOW_CHILD_OFFSET, PageId::to_raw(child));
    }

    /// Inserts a new separator. Duplicates are rejected.
    pub fn insert(&mut self, key: &DeweyId, value: StoredValue<'_>) -> Result<BranchInsert> {
        let idx = match self.position(key)? {
            Ok(_) => return Err(ArborError::Invalid("separator already present")),
            Err(idx) => idx,
        };
        let key_bytes = key.to_bytes();
        let mut record = Vec::with_capacity(record_cost(&key_bytes, value));
        encode_record(&key_bytes, value, &mut record)?;
        if record.len() + SLOT_ENTRY_LEN > self.free_space() {
            return Ok(BranchInsert::NoSpace);
        }
        let count = self.len();
        let payload_len = self.payload().len();
        let payload = self.payload_mut();
        let free_start = read_u16(payload, FREE_START_OFFSET) as usize;
        payload[free_start..free_start + record.len()].copy_from_slice(&record);
        let dir_start = payload_len - count * SLOT_ENTRY_LEN;
        let new_dir_start = dir_start - SLOT_ENTRY_LEN;
        payload.copy_within(dir_start..dir_start + idx * SLOT_ENTRY_LEN, new_dir_start);
        let pos = new_dir_start + idx * SLOT_ENTRY_LEN;
        write_u16(payload, pos, free_start as u16);
        write_u16(payload, pos + 2, record.len() as u16);
        write_u16(payload, NSLOTS_OFFSET, (count + 1) as u16);
        write_u16(payload, FREE_START_OFFSET, (free_start + record.len()) as u16);
        write_u16(payload, FREE_END_OFFSET, new_dir_start as u16);
        Ok(BranchInsert::Inserted(idx))
    }

    /// Removes the record at `idx` and returns it.
    pub fn delete(&mut self, idx: usize) -> Result<(DeweyId, OwnedValue)> {
        let removed = {
            let record = self.record(idx)?;
            (DeweyId::from_bytes(record.key)?, record.value.to_owned_value())
        };
        let mut records = self.owned_records()?;
        records.remove(idx);
        self.rebuild(&records)?;
        Ok(removed)
    }

    /// Replaces the value at `idx`.
    pub fn set_value(&mut self, idx: usize, value: StoredValue<'_>) -> Result<BranchUpdate> {
        let mut records = self.owned_records()?;
        let slot = records
            .get_mut(idx)
            .ok_or(ArborError::Invalid("slot index out of range"))?;
        let old_cost = record_cost(&slot.0, slot.1.as_stored());
        let new_cost = record_cost(&slot.0, value);
        if new_cost > old_cost && new_cost - old_cost > self.free_space() {
            return Ok(BranchUpdate::NoSpace);
        }
        let previous = std::mem::replace(&mut slot.1, value.to_owned_value());
        self.rebuild(&records)?;
        Ok(BranchUpdate::Updated(previous))
    }

    /// Moves the records above the middle one into the empty branch `dst`
    /// and removes the middle one, returning its separator for the parent.
    /// The middle record's child becomes the low child of `dst`.
    pub fn split_into<D>(&mut self, dst: &mut BranchPage<D>) -> Result<DeweyId>
    where
        D: AsRef<[u8]> + AsMut<[u8]>,
    {
        if !dst.is_empty() {
            return Err(ArborError::Invalid("split destination must be empty"));
        }
        let count = self.len();
        if count < 3 {
            return Err(ArborError::Invalid("cannot split a branch with fewer than three records"));
        }
        let mid = count / 2;
        let promoted = self.key_at(mid)?;
        let mid_child = self.child_at(mid)?;
        let mut records = self.owned_records()?;
        let upper = records.split_off(mid + 1);
        records.truncate(mid);
        dst.set_low_child(Some(mid_child));
        dst.rebuild(&upper)?;
        self.rebuild(&records)?;
        Ok(promoted)
    }

    fn owned_records(&self) -> Result<Vec<(Vec<u8>, OwnedValue)>> {
        (0..self.len())
            .map(|idx| {
                let record = self.record(idx)?;
                Ok((record.key.to_vec(), record.value.to_owned_value()))
            })
            .collect()
    }

    /// Rewrites the record area and slot directory from `records`, which
    /// must already be in separator order.
    fn rebuild(&mut self, records: &[(Vec<u8>, OwnedValue)]) -> Result<()> {
        let mut area = Vec::new();
        let mut extents = Vec::with_capacity(records.len());
        for (key, value) in records {
            let start = BRANCH_HEADER_LEN + area.len();
            encode_record(key, value.as_stored(), &mut area)?;
            extents.push((start, BRANCH_HEADER_LEN + area.len() - start));
        }
        let payload_len = self.payload().len();
        let dir_start = payload_len
            .checked_sub(records.len() * SLOT_ENTRY_LEN)
            .ok_or(ArborError::Invalid("branch records exceed page"))?;
        if BRANCH_HEADER_LEN + area.len() > dir_start {
            return Err(ArborError::Invalid("branch records exceed page"));
        }
        let payload = self.payload_mut();
        payload[BRANCH_HEADER_LEN..].fill(0);
        payload[BRANCH_HEADER_LEN..BRANCH_HEADER_LEN + area.len()].copy_from_slice(&area);
        for (idx, (start, len)) in extents.iter().enumerate() {
            let pos = dir_start + idx * SLOT_ENTRY_LEN;
            write_u16(payload, pos, *start as u16);
            write_u16(payload, pos + 2, *len as u16);
        }
        write_u16(payload, NSLOTS_OFFSET, records.len() as u16);
        write_u16(payload, FREE_START_OFFSET, (BRANCH_HEADER_LEN + area.len()) as u16);
        write_u16(payload, FREE_END_OFFSET, dir_start as u16);
        Ok(())
    }
}
