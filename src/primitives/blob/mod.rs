#![forbid(unsafe_code)]

use std::cmp::min;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::buffer::{LatchMode, PageBuffer};
use crate::primitives::bytes::fixed::{read_u32, read_u64, write_u32, write_u64};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{ArborError, Checksum, Crc32Fast, Lsn, PageId, Result};

/// Bytes at the start of every overflow payload: `next u64 | used u32 | crc u32`.
pub const OVERFLOW_HEADER_LEN: usize = 16;

/// Out-of-page byte storage addressed by the id of the blob's first page.
pub trait BlobStore: Send + Sync {
    /// Creates an empty blob.
    fn create(&self) -> Result<PageId>;
    /// Replaces the contents of `blob`.
    fn write(&self, blob: PageId, bytes: &[u8]) -> Result<()>;
    /// Reads the whole blob.
    fn read(&self, blob: PageId) -> Result<Vec<u8>>;
    /// Releases every page of the blob.
    fn drop_blob(&self, blob: PageId) -> Result<()>;
}

/// Counters kept by [`OverflowBlobStore`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlobStatsSnapshot {
    /// Overflow pages allocated
    pub pages_allocated: u64,
    /// Overflow pages released
    pub pages_freed: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Bytes read
    pub bytes_read: u64,
}

#[derive(Default)]
struct BlobStats {
    pages_allocated: AtomicU64,
    pages_freed: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// [`BlobStore`] that keeps each blob in a chain of overflow pages.
///
/// The head page's CRC field covers the whole blob; follower pages store zero.
pub struct OverflowBlobStore {
    buffer: Arc<dyn PageBuffer>,
    page_size: usize,
    data_capacity: usize,
    stats: BlobStats,
}

struct ChainPage {
    next: Option<PageId>,
    used: usize,
    crc: u32,
}

impl OverflowBlobStore {
    /// Creates a store allocating its pages from `buffer`.
    pub fn new(buffer: Arc<dyn PageBuffer>) -> Result<Self> {
        let page_size = buffer.page_size();
        if page_size <= PAGE_HDR_LEN + OVERFLOW_HEADER_LEN {
            return Err(ArborError::Invalid("page size too small for overflow payload"));
        }
        Ok(Self {
            buffer,
            page_size,
            data_capacity: page_size - PAGE_HDR_LEN - OVERFLOW_HEADER_LEN,
            stats: BlobStats::default(),
        })
    }

    /// Payload bytes one overflow page holds.
    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    /// Current counters.
    pub fn stats(&self) -> BlobStatsSnapshot {
        BlobStatsSnapshot {
            pages_allocated: self.stats.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.stats.pages_freed.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.stats.bytes_read.load(Ordering::Relaxed),
        }
    }

    fn decode_page(&self, id: PageId, data: &[u8]) -> Result<ChainPage> {
        let header = PageHeader::decode(data)?;
        if header.kind != PageKind::Overflow {
            return Err(ArborError::Corruption("page is not overflow kind"));
        }
        if header.page_no != id {
            return Err(ArborError::Corruption("overflow page id mismatch"));
        }
        if header.page_size as usize != self.page_size {
            return Err(ArborError::Corruption("overflow page size mismatch"));
        }
        let payload = &data[PAGE_HDR_LEN..];
        let used = read_u32(payload, 8) as usize;
        if used > self.data_capacity {
            return Err(ArborError::Corruption("overflow used bytes exceed capacity"));
        }
        Ok(ChainPage {
            next: PageId::from_raw(read_u64(payload, 0)),
            used,
            crc: read_u32(payload, 12),
        })
    }

    fn write_page(&self, data: &mut [u8], id: PageId, next: Option<PageId>, chunk: &[u8], crc: u32) -> Result<()> {
        let lsn = page::read_lsn(data).unwrap_or(Lsn(0));
        data.fill(0);
        PageHeader::new(id, PageKind::Overflow, self.page_size as u32)?
            .with_lsn(lsn)
            .encode(data)?;
        let payload = &mut data[PAGE_HDR_LEN..];
        write_u64(payload, 0, PageId::to_raw(next));
        write_u32(payload, 8, chunk.len() as u32);
        write_u32(payload, 12, crc);
        payload[OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + chunk.len()].copy_from_slice(chunk);
        Ok(())
    }

    fn chain(&self, blob: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut current = Some(blob);
        while let Some(id) = current {
            if pages.contains(&id) {
                return Err(ArborError::Corruption("overflow chain contains a cycle"));
            }
            let handle = self.buffer.fix(id, LatchMode::Shared)?;
            let page = self.decode_page(id, handle.bytes()?)?;
            pages.push(id);
            current = page.next;
        }
        Ok(pages)
    }

    fn write_chain(&self, blob: PageId, bytes: &[u8]) -> Result<()> {
        let needed = if bytes.is_empty() {
            1
        } else {
            (bytes.len() + self.data_capacity - 1) / self.data_capacity
        };
        let mut pages = self.chain(blob)?;
        while pages.len() < needed {
            let handle = self.buffer.allocate()?;
            pages.push(handle.id());
            self.stats.pages_allocated.fetch_add(1, Ordering::Relaxed);
        }
        for extra in pages.split_off(needed) {
            self.buffer.delete_deferred(extra)?;
            self.stats.pages_freed.fetch_add(1, Ordering::Relaxed);
        }
        let mut checksum = Crc32Fast::default();
        checksum.update(bytes);
        let crc = checksum.finalize();
        let mut offset = 0;
        for (idx, id) in pages.iter().enumerate() {
            let chunk_len = min(bytes.len() - offset, self.data_capacity);
            let chunk = &bytes[offset..offset + chunk_len];
            let next = pages.get(idx + 1).copied();
            let mut handle = self.buffer.fix(*id, LatchMode::Exclusive)?;
            self.write_page(handle.bytes_mut()?, *id, next, chunk, if idx == 0 { crc } else { 0 })?;
            offset += chunk_len;
        }
        self.stats.bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        debug!(blob = blob.0, pages = pages.len(), len = bytes.len(), "blob.write");
        Ok(())
    }

    fn read_chain(&self, blob: PageId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut expected_crc = None;
        let mut current = Some(blob);
        let mut visited = 0usize;
        while let Some(id) = current {
            visited += 1;
            if visited > self.max_chain_pages() {
                return Err(ArborError::Corruption("overflow chain too long"));
            }
            let handle = self.buffer.fix(id, LatchMode::Shared)?;
            let data = handle.bytes()?;
            let page = self.decode_page(id, data)?;
            if expected_crc.is_none() {
                expected_crc = Some(page.crc);
            }
            let start = PAGE_HDR_LEN + OVERFLOW_HEADER_LEN;
            out.extend_from_slice(&data[start..start + page.used]);
            current = page.next;
        }
        let mut checksum = Crc32Fast::default();
        checksum.update(&out);
        if Some(checksum.finalize()) != expected_crc {
            return Err(ArborError::Corruption("blob checksum mismatch"));
        }
        self.stats.bytes_read.fetch_add(out.len() as u64, Ordering::Relaxed);
        trace!(blob = blob.0, len = out.len(), "blob.read");
        Ok(out)
    }

    fn max_chain_pages(&self) -> usize {
        (u32::MAX as usize / self.data_capacity) + 1
    }
}

impl BlobStore for OverflowBlobStore {
    fn create(&self) -> Result<PageId> {
        let mut handle = self.buffer.allocate()?;
        let id = handle.id();
        let crc = Crc32Fast::default().finalize();
        self.write_page(handle.bytes_mut()?, id, None, &[], crc)
            .map_err(|err| err.at_page(id))?;
        self.stats.pages_allocated.fetch_add(1, Ordering::Relaxed);
        trace!(blob = id.0, "blob.create");
        Ok(id)
    }

    fn write(&self, blob: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u32::MAX as usize {
            return Err(ArborError::Invalid("blob larger than 4GB not supported"));
        }
        self.write_chain(blob, bytes).map_err(|err| err.at_page(blob))
    }

    fn read(&self, blob: PageId) -> Result<Vec<u8>> {
        self.read_chain(blob).map_err(|err| err.at_page(blob))
    }

    fn drop_blob(&self, blob: PageId) -> Result<()> {
        let pages = self.chain(blob).map_err(|err| err.at_page(blob))?;
        for id in &pages {
            self.buffer.delete_deferred(*id).map_err(|err| err.at_page(blob))?;
        }
        self.stats.pages_freed.fetch_add(pages.len() as u64, Ordering::Relaxed);
        debug!(blob = blob.0, pages = pages.len(), "blob.drop");
        Ok(())
    }
}
