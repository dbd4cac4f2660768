#![forbid(unsafe_code)]
//! Identifiers, the crate error type and the common page header.

use std::fmt;

pub mod checksum;
pub mod dewey;

pub use checksum::{page_crc32, Checksum, Crc32Fast};
pub use dewey::{DeweyId, DocId};

/// Identifier of a fixed-size page. `PageId(0)` never names a live page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Log sequence number handed out by a [`crate::primitives::log::LogFacility`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Lsn(pub u64);

/// Transaction identifier carried in log records.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

impl PageId {
    /// Decodes an optional page id where zero means "none".
    pub fn from_raw(raw: u64) -> Option<PageId> {
        if raw == 0 {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Encodes an optional page id, zero standing for "none".
    pub fn to_raw(page: Option<PageId>) -> u64 {
        page.map(|p| p.0).unwrap_or(0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum ArborError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-page or on-disk structures violate an invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Variant of [`ArborError::Invalid`] with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// A delta key counter does not fit its on-page width.
    #[error("bracket key overflow: {0}")]
    EncodingOverflow(&'static str),
    /// Deleting the prepared range would leave the leaf without any node.
    #[error("leaf page {0} would become empty")]
    EmptyLeaf(PageId),
    /// Operation requires a latch mode the context does not hold.
    #[error("latch: {0}")]
    Latch(&'static str),
    /// Configuration could not be parsed or failed validation.
    #[error("configuration: {0}")]
    Config(String),
    /// A collaborator failed while operating on the given page or blob.
    #[error("page {page}: {source}")]
    Page {
        /// Offending page or blob id.
        page: PageId,
        /// Underlying failure.
        #[source]
        source: Box<ArborError>,
    },
}

impl ArborError {
    /// Wraps the error with the id of the page it concerns, unless already wrapped.
    pub fn at_page(self, page: PageId) -> Self {
        match self {
            err @ ArborError::Page { .. } => err,
            err => ArborError::Page {
                page,
                source: Box::new(err),
            },
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArborError>;

pub mod page {
    //! Common header shared by every page kind.

    use core::convert::TryFrom;

    use crate::primitives::bytes::fixed;

    use super::{page_crc32, ArborError, Lsn, PageId, Result};

    /// Magic bytes at the start of every formatted page.
    pub const PAGE_MAGIC: [u8; 4] = *b"ARBR";
    /// On-page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when none is configured.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Length of the common header.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const LSN: Range<usize> = 20..28;
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Physical page kinds understood by the engine.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum PageKind {
        /// Bracket-encoded leaf page.
        Leaf = 1,
        /// Slotted branch page.
        Branch = 2,
        /// Blob overflow page.
        Overflow = 3,
    }

    impl PageKind {
        /// Returns the on-page byte for this kind.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = ArborError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Leaf),
                2 => Ok(PageKind::Branch),
                3 => Ok(PageKind::Overflow),
                _ => Err(ArborError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded common page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version the page was written with.
        pub format_version: u16,
        /// Physical kind.
        pub kind: PageKind,
        /// Page size in bytes.
        pub page_size: u32,
        /// Page id the page was formatted for.
        pub page_no: PageId,
        /// LSN of the last logged change applied to the page.
        pub lsn: Lsn,
        /// CRC32 written by [`seal`]; zero when the page was never sealed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Creates a header for a freshly formatted page.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(ArborError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                lsn: Lsn(0),
                crc32: 0,
            })
        }

        /// Sets the page LSN.
        pub fn with_lsn(mut self, lsn: Lsn) -> Self {
            self.lsn = lsn;
            self
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(ArborError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::LSN].copy_from_slice(&self.lsn.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Decodes and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(ArborError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(ArborError::Corruption("invalid page magic"));
            }
            let format_version = fixed::read_u16(hdr, header::FORMAT_VERSION.start);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(ArborError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(ArborError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = fixed::read_u32(hdr, header::PAGE_SIZE.start);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(ArborError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(fixed::read_u64(hdr, header::PAGE_NO.start));
            let lsn = Lsn(fixed::read_u64(hdr, header::LSN.start));
            let crc32 = fixed::read_u32(hdr, header::CRC32.start);
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                lsn,
                crc32,
            })
        }
    }

    /// Reads the kind byte without decoding the rest of the header.
    pub fn read_kind(page: &[u8]) -> Result<PageKind> {
        if page.len() < PAGE_HDR_LEN || page[header::MAGIC] != PAGE_MAGIC {
            return Err(ArborError::Corruption("page is not formatted"));
        }
        PageKind::try_from(page[header::PAGE_KIND])
    }

    /// Reads the page LSN.
    pub fn read_lsn(page: &[u8]) -> Result<Lsn> {
        if page.len() < PAGE_HDR_LEN {
            return Err(ArborError::Corruption("page header truncated"));
        }
        Ok(Lsn(fixed::read_u64(page, header::LSN.start)))
    }

    /// Stores a new page LSN.
    pub fn write_lsn(page: &mut [u8], lsn: Lsn) -> Result<()> {
        if page.len() < PAGE_HDR_LEN {
            return Err(ArborError::Invalid("page header buffer too small"));
        }
        page[header::LSN].copy_from_slice(&lsn.0.to_be_bytes());
        Ok(())
    }

    /// Reads the page id recorded in the header.
    pub fn read_page_no(page: &[u8]) -> Result<PageId> {
        if page.len() < PAGE_HDR_LEN {
            return Err(ArborError::Corruption("page header truncated"));
        }
        Ok(PageId(fixed::read_u64(page, header::PAGE_NO.start)))
    }

    /// Zeroes the CRC field.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(ArborError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Computes the page CRC over header and payload and stores it in the header.
    pub fn seal(page: &mut [u8]) -> Result<u32> {
        clear_crc32(page)?;
        let page_no = read_page_no(page)?;
        let crc = page_crc32(page_no.0, page);
        page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(crc)
    }

    /// Checks the stored CRC. Pages that were never sealed (CRC zero) pass.
    pub fn verify(page: &[u8]) -> Result<()> {
        let header = PageHeader::decode(page)?;
        if header.crc32 == 0 {
            return Ok(());
        }
        let mut scratch = page.to_vec();
        clear_crc32(&mut scratch)?;
        if page_crc32(header.page_no.0, &scratch) != header.crc32 {
            return Err(ArborError::Corruption("page checksum mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::page::{self, PageHeader, PageKind};
    use super::{ArborError, Lsn, PageId, Result};
    use std::convert::TryFrom;

    #[test]
    fn page_header_roundtrip() -> Result<()> {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let header =
            PageHeader::new(PageId(42), PageKind::Leaf, page::DEFAULT_PAGE_SIZE)?.with_lsn(Lsn(9));
        header.encode(&mut buf)?;
        assert_eq!(PageHeader::decode(&buf)?, header);
        assert_eq!(page::read_kind(&buf)?, PageKind::Leaf);
        assert_eq!(page::read_lsn(&buf)?, Lsn(9));
        Ok(())
    }

    #[test]
    fn seal_detects_payload_changes() -> Result<()> {
        let mut buf = vec![0u8; 256];
        PageHeader::new(PageId(3), PageKind::Branch, 256)?.encode(&mut buf)?;
        buf[100] = 7;
        page::seal(&mut buf)?;
        page::verify(&buf)?;
        buf[101] = 1;
        assert!(matches!(page::verify(&buf), Err(ArborError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn page_kind_from_u8_rejects_unknown() {
        assert!(PageKind::try_from(0).is_err());
        assert!(PageKind::try_from(9).is_err());
    }

    #[test]
    fn at_page_wraps_once() {
        let err = ArborError::NotFound.at_page(PageId(4)).at_page(PageId(5));
        match err {
            ArborError::Page { page, source } => {
                assert_eq!(page, PageId(4));
                assert!(matches!(*source, ArborError::NotFound));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
