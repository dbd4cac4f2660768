#![forbid(unsafe_code)]
//! Encoding and buffer utilities shared across storage layers.

pub mod ord {
    //! Order-preserving encoders for identifier components.
    //!
    //! Divisions use a prefix-free variable-width form whose first byte
    //! selects the width, so byte-wise comparison of concatenated divisions
    //! matches numeric comparison division by division.

    use crate::types::{ArborError, Result};

    const ONE_BYTE_LIMIT: u32 = 0x80;
    const TWO_BYTE_LIMIT: u32 = 0x4000;
    const FOUR_BYTE_LIMIT: u32 = 0x2000_0000;
    const TWO_BYTE_TAG: u8 = 0x80;
    const FOUR_BYTE_TAG: u8 = 0xC0;
    const WIDE_TAG: u8 = 0xE0;

    /// Appends a big-endian u32.
    pub fn put_u32_be(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Number of bytes [`put_division`] writes for `v`.
    pub fn division_len(v: u32) -> usize {
        if v < ONE_BYTE_LIMIT {
            1
        } else if v < TWO_BYTE_LIMIT {
            2
        } else if v < FOUR_BYTE_LIMIT {
            4
        } else {
            5
        }
    }

    /// Appends one division.
    pub fn put_division(dst: &mut Vec<u8>, v: u32) {
        if v < ONE_BYTE_LIMIT {
            dst.push(v as u8);
        } else if v < TWO_BYTE_LIMIT {
            dst.push(TWO_BYTE_TAG | (v >> 8) as u8);
            dst.push(v as u8);
        } else if v < FOUR_BYTE_LIMIT {
            dst.push(FOUR_BYTE_TAG | (v >> 24) as u8);
            dst.extend_from_slice(&v.to_be_bytes()[1..]);
        } else {
            dst.push(WIDE_TAG);
            dst.extend_from_slice(&v.to_be_bytes());
        }
    }

    /// Decodes one division at `*off`, advancing the offset.
    pub fn get_division(src: &[u8], off: &mut usize) -> Result<u32> {
        let first = *src
            .get(*off)
            .ok_or(ArborError::Corruption("division truncated"))?;
        let (len, value) = if first < TWO_BYTE_TAG {
            (1, first as u32)
        } else if first < FOUR_BYTE_TAG {
            let rest = tail(src, *off, 2)?;
            let v = (((first & 0x3F) as u32) << 8) | rest[1] as u32;
            if v < ONE_BYTE_LIMIT {
                return Err(ArborError::Corruption("division not minimally encoded"));
            }
            (2, v)
        } else if first < WIDE_TAG {
            let rest = tail(src, *off, 4)?;
            let v = (((first & 0x1F) as u32) << 24)
                | ((rest[1] as u32) << 16)
                | ((rest[2] as u32) << 8)
                | rest[3] as u32;
            if v < TWO_BYTE_LIMIT {
                return Err(ArborError::Corruption("division not minimally encoded"));
            }
            (4, v)
        } else if first == WIDE_TAG {
            let rest = tail(src, *off, 5)?;
            let v = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
            if v < FOUR_BYTE_LIMIT {
                return Err(ArborError::Corruption("division not minimally encoded"));
            }
            (5, v)
        } else {
            return Err(ArborError::Corruption("invalid division tag"));
        };
        *off += len;
        Ok(value)
    }

    fn tail(src: &[u8], off: usize, len: usize) -> Result<&[u8]> {
        src.get(off..off + len)
            .ok_or(ArborError::Corruption("division truncated"))
    }
}

pub mod fixed {
    //! Fixed-width big-endian field access at known offsets.
    //!
    //! Callers validate bounds against their layout before using these.

    /// Reads a u16 at `offset`.
    #[inline]
    pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&buf[offset..offset + 2]);
        u16::from_be_bytes(raw)
    }

    /// Writes a u16 at `offset`.
    #[inline]
    pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a u32 at `offset`.
    #[inline]
    pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[offset..offset + 4]);
        u32::from_be_bytes(raw)
    }

    /// Writes a u32 at `offset`.
    #[inline]
    pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a u64 at `offset`.
    #[inline]
    pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        u64::from_be_bytes(raw)
    }

    /// Writes a u64 at `offset`.
    #[inline]
    pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }
}

pub mod buf {
    //! A slice-backed reader that reports truncation as corruption.

    use core::fmt;

    use crate::types::{ArborError, Result};

    /// Sequential reader over a byte slice.
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Reader<'a> {
        /// Creates a reader positioned at the start of `buf`.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Current offset.
        pub fn offset(&self) -> usize {
            self.off
        }

        /// Bytes left to read.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// True once every byte has been consumed.
        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(ArborError::Corruption("reader offset overflow"))?;
            let slice = self
                .buf
                .get(self.off..end)
                .ok_or(ArborError::Corruption("record truncated"))?;
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            let bytes = self.take(2)?;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let bytes = self.take(4)?;
            Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(raw))
        }
    }

    impl<'a> fmt::Debug for Reader<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Reader")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
