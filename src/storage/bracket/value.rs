//! Value fields shared by leaf data areas and node sequences.
//!
//! A field starts with a one-byte length for values shorter than 255 bytes,
//! `0xFF` plus a u16 length otherwise, or the sentinel `0xFF 0xFF 0xFF`
//! followed by the eight-byte id of the blob holding an externalized value.

use crate::types::{ArborError, PageId, Result};

/// Marks a long length or, tripled, an externalized value.
pub const LONG_LEN_TAG: u8 = 0xFF;
/// Prefix of an externalized value field.
pub const EXTERNAL_SENTINEL: [u8; 3] = [0xFF; 3];
/// Size of the blob reference that follows the sentinel.
pub const EXTERNAL_REF_LEN: usize = 8;
/// Encoded size of an externalized value field.
pub const EXTERNAL_FIELD_LEN: usize = EXTERNAL_SENTINEL.len() + EXTERNAL_REF_LEN;
/// Longest value that can be stored inline.
pub const MAX_INLINE_VALUE_LEN: usize = 0xFFFE;

/// Borrowed view of a stored value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoredValue<'a> {
    /// Bytes kept in the page.
    Inline(&'a [u8]),
    /// Bytes kept in a blob.
    External(PageId),
}

/// Owned counterpart of [`StoredValue`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OwnedValue {
    /// Bytes kept in the page.
    Inline(Vec<u8>),
    /// Bytes kept in a blob.
    External(PageId),
}

impl<'a> StoredValue<'a> {
    /// Size of the encoded field.
    pub fn encoded_len(&self) -> usize {
        match self {
            StoredValue::Inline(bytes) if bytes.len() < LONG_LEN_TAG as usize => 1 + bytes.len(),
            StoredValue::Inline(bytes) => 3 + bytes.len(),
            StoredValue::External(_) => EXTERNAL_FIELD_LEN,
        }
    }

    /// Rejects inline values too long for the length field.
    pub fn check(&self) -> Result<()> {
        match self {
            StoredValue::Inline(bytes) if bytes.len() > MAX_INLINE_VALUE_LEN => {
                Err(ArborError::Invalid("inline value longer than the length field allows"))
            }
            StoredValue::External(PageId(0)) => Err(ArborError::Invalid("blob reference is null")),
            _ => Ok(()),
        }
    }

    /// Appends the encoded field.
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        match self {
            StoredValue::Inline(bytes) if bytes.len() < LONG_LEN_TAG as usize => {
                dst.push(bytes.len() as u8);
                dst.extend_from_slice(bytes);
            }
            StoredValue::Inline(bytes) => {
                dst.push(LONG_LEN_TAG);
                dst.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                dst.extend_from_slice(bytes);
            }
            StoredValue::External(page) => {
                dst.extend_from_slice(&EXTERNAL_SENTINEL);
                dst.extend_from_slice(&page.0.to_be_bytes());
            }
        }
    }

    /// Writes the encoded field at the start of `dst`, which must hold
    /// exactly [`StoredValue::encoded_len`] bytes or more.
    pub fn write_to(&self, dst: &mut [u8]) {
        let mut scratch = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut scratch);
        dst[..scratch.len()].copy_from_slice(&scratch);
    }

    /// Decodes the field at the start of `src`, returning it with its length.
    pub fn decode(src: &'a [u8]) -> Result<(StoredValue<'a>, usize)> {
        let first = *src
            .first()
            .ok_or(ArborError::Corruption("value field truncated"))?;
        if first != LONG_LEN_TAG {
            let end = 1 + first as usize;
            let bytes = src
                .get(1..end)
                .ok_or(ArborError::Corruption("inline value truncated"))?;
            return Ok((StoredValue::Inline(bytes), end));
        }
        let len_bytes = src
            .get(1..3)
            .ok_or(ArborError::Corruption("value length truncated"))?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]);
        if len == u16::MAX {
            let raw = src
                .get(3..EXTERNAL_FIELD_LEN)
                .ok_or(ArborError::Corruption("blob reference truncated"))?;
            let mut id = [0u8; 8];
            id.copy_from_slice(raw);
            return Ok((StoredValue::External(PageId(u64::from_be_bytes(id))), EXTERNAL_FIELD_LEN));
        }
        if (len as usize) < LONG_LEN_TAG as usize {
            return Err(ArborError::Corruption("long value field holds a short value"));
        }
        let end = 3 + len as usize;
        let bytes = src
            .get(3..end)
            .ok_or(ArborError::Corruption("inline value truncated"))?;
        Ok((StoredValue::Inline(bytes), end))
    }

    /// Copies into an owned value.
    pub fn to_owned_value(&self) -> OwnedValue {
        match self {
            StoredValue::Inline(bytes) => OwnedValue::Inline(bytes.to_vec()),
            StoredValue::External(page) => OwnedValue::External(*page),
        }
    }

    /// Blob id if the value is externalized.
    pub fn external(&self) -> Option<PageId> {
        match self {
            StoredValue::External(page) => Some(*page),
            StoredValue::Inline(_) => None,
        }
    }
}

impl OwnedValue {
    /// Borrowed view.
    pub fn as_stored(&self) -> StoredValue<'_> {
        match self {
            OwnedValue::Inline(bytes) => StoredValue::Inline(bytes),
            OwnedValue::External(page) => StoredValue::External(*page),
        }
    }

    /// Blob id if the value is externalized.
    pub fn external(&self) -> Option<PageId> {
        self.as_stored().external()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: StoredValue<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        value.encode_into(&mut out);
        assert_eq!(out.len(), value.encoded_len());
        out
    }

    #[test]
    fn short_long_and_external_fields() -> Result<()> {
        let short = vec![7u8; 254];
        let field = encode(StoredValue::Inline(&short));
        assert_eq!(field[0], 254);
        assert_eq!(StoredValue::decode(&field)?, (StoredValue::Inline(&short[..]), 255));

        let long = vec![9u8; 255];
        let field = encode(StoredValue::Inline(&long));
        assert_eq!(&field[..3], &[0xFF, 0x00, 0xFF]);
        assert_eq!(StoredValue::decode(&field)?.0, StoredValue::Inline(&long[..]));

        let field = encode(StoredValue::External(PageId(0x0102)));
        assert_eq!(&field[..3], &EXTERNAL_SENTINEL);
        assert_eq!(
            StoredValue::decode(&field)?,
            (StoredValue::External(PageId(0x0102)), EXTERNAL_FIELD_LEN)
        );
        Ok(())
    }

    #[test]
    fn empty_value_is_one_byte() -> Result<()> {
        let field = encode(StoredValue::Inline(&[]));
        assert_eq!(field, vec![0]);
        assert_eq!(StoredValue::decode(&field)?.1, 1);
        Ok(())
    }

    #[test]
    fn decode_rejects_truncation_and_oversized_inline() {
        assert!(StoredValue::decode(&[5, 1, 2]).is_err());
        assert!(StoredValue::decode(&[0xFF, 0xFF, 0xFF, 1]).is_err());
        assert!(StoredValue::decode(&[0xFF, 0x00, 0x10]).is_err());
        let huge = vec![0u8; MAX_INLINE_VALUE_LEN + 1];
        assert!(StoredValue::Inline(&huge).check().is_err());
    }
}
