use crate::primitives::bytes::buf::Reader;
use crate::storage::bracket::value::OwnedValue;
use crate::types::page::PageKind;
use crate::types::{ArborError, DeweyId, PageId, Result, TxId};

/// Change applied to one page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PageOperation {
    /// Page re-typed and reset.
    Format {
        /// New kind.
        kind: PageKind,
    },
    /// Node inserted into a leaf.
    LeafInsert {
        /// Inserted node.
        id: DeweyId,
        /// Its stored value.
        value: OwnedValue,
    },
    /// Value of a leaf node replaced.
    LeafUpdate {
        /// Updated node.
        id: DeweyId,
        /// Value before the change.
        before: OwnedValue,
        /// Value after the change.
        after: OwnedValue,
    },
    /// Nodes removed from a leaf, in document order.
    LeafDelete {
        /// Removed nodes with their values.
        nodes: Vec<(DeweyId, OwnedValue)>,
    },
    /// Tail of a leaf moved to a new right sibling.
    LeafSplit {
        /// Page that received the tail.
        right: PageId,
        /// New high key of the split page.
        separator: DeweyId,
    },
    /// Nodes written into a freshly formatted leaf, e.g. the tail moved
    /// there by a split.
    LeafLoad {
        /// High key of the loaded page.
        high: Option<DeweyId>,
        /// Wire form of the loaded node sequence.
        sequence: Vec<u8>,
    },
    /// Empty leaf removed from the sibling chain.
    LeafUnchain {
        /// Left neighbour at the time of removal.
        prev: Option<PageId>,
        /// Right neighbour at the time of removal.
        next: Option<PageId>,
    },
    /// Sibling pointers of a leaf rewritten.
    LeafLink {
        /// New left neighbour.
        prev: Option<PageId>,
        /// New right neighbour.
        next: Option<PageId>,
    },
    /// Separator inserted into a branch.
    BranchInsert {
        /// Separator.
        key: DeweyId,
        /// Stored value.
        value: OwnedValue,
    },
    /// Branch value replaced.
    BranchUpdate {
        /// Separator.
        key: DeweyId,
        /// Value before the change.
        before: OwnedValue,
        /// Value after the change.
        after: OwnedValue,
    },
    /// Separator removed from a branch.
    BranchDelete {
        /// Separator.
        key: DeweyId,
        /// Removed value.
        value: OwnedValue,
    },
    /// Upper half of a branch moved to a new page.
    BranchSplit {
        /// Page that received the upper half.
        right: PageId,
        /// Promoted separator.
        separator: DeweyId,
    },
    /// Low child pointer of a branch replaced.
    SetLowChild {
        /// Pointer before the change.
        before: Option<PageId>,
        /// Pointer after the change.
        after: Option<PageId>,
    },
}

impl PageOperation {
    fn tag(&self) -> u8 {
        match self {
            PageOperation::Format { .. } => 1,
            PageOperation::LeafInsert { .. } => 2,
            PageOperation::LeafUpdate { .. } => 3,
            PageOperation::LeafDelete { .. } => 4,
            PageOperation::LeafSplit { .. } => 5,
            PageOperation::LeafUnchain { .. } => 6,
            PageOperation::BranchInsert { .. } => 7,
            PageOperation::BranchUpdate { .. } => 8,
            PageOperation::BranchDelete { .. } => 9,
            PageOperation::BranchSplit { .. } => 10,
            PageOperation::LeafLink { .. } => 11,
            PageOperation::SetLowChild { .. } => 12,
            PageOperation::LeafLoad { .. } => 13,
        }
    }
}

/// A page change attributed to a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Owning transaction.
    pub tx: TxId,
    /// Changed page.
    pub page: PageId,
    /// The change.
    pub op: PageOperation,
}

fn put_id(dst: &mut Vec<u8>, id: &DeweyId) -> Result<()> {
    let len = u16::try_from(id.encoded_len()).map_err(|_| ArborError::Invalid("identifier too long to log"))?;
    dst.extend_from_slice(&len.to_be_bytes());
    id.encode_into(dst);
    Ok(())
}

fn get_id(reader: &mut Reader<'_>) -> Result<DeweyId> {
    let len = reader.u16()? as usize;
    DeweyId::from_bytes(reader.take(len)?)
}

fn put_value(dst: &mut Vec<u8>, value: &OwnedValue) -> Result<()> {
    match value {
        OwnedValue::Inline(bytes) => {
            let len = u32::try_from(bytes.len()).map_err(|_| ArborError::Invalid("value too long to log"))?;
            dst.push(0);
            dst.extend_from_slice(&len.to_be_bytes());
            dst.extend_from_slice(bytes);
        }
        OwnedValue::External(page) => {
            dst.push(1);
            dst.extend_from_slice(&page.0.to_be_bytes());
        }
    }
    Ok(())
}

fn get_value(reader: &mut Reader<'_>) -> Result<OwnedValue> {
    match reader.u8()? {
        0 => {
            let len = reader.u32()? as usize;
            Ok(OwnedValue::Inline(reader.take(len)?.to_vec()))
        }
        1 => Ok(OwnedValue::External(PageId(reader.u64()?))),
        _ => Err(ArborError::Corruption("unknown logged value tag")),
    }
}

fn put_page(dst: &mut Vec<u8>, page: Option<PageId>) {
    dst.extend_from_slice(&PageId::to_raw(page).to_be_bytes());
}

impl LogRecord {
    /// Encodes the record into `dst`.
    pub fn encode_into(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.extend_from_slice(&self.tx.0.to_be_bytes());
        dst.extend_from_slice(&self.page.0.to_be_bytes());
        dst.push(self.op.tag());
        match &self.op {
            PageOperation::Format { kind } => dst.push(kind.as_u8()),
            PageOperation::LeafInsert { id, value } => {
                put_id(dst, id)?;
                put_value(dst, value)?;
            }
            PageOperation::LeafUpdate { id, before, after } => {
                put_id(dst, id)?;
                put_value(dst, before)?;
                put_value(dst, after)?;
            }
            PageOperation::LeafDelete { nodes } => {
                let count = u32::try_from(nodes.len()).map_err(|_| ArborError::Invalid("too many nodes to log"))?;
                dst.extend_from_slice(&count.to_be_bytes());
                for (id, value) in nodes {
                    put_id(dst, id)?;
                    put_value(dst, value)?;
                }
            }
            PageOperation::LeafSplit { right, separator } | PageOperation::BranchSplit { right, separator } => {
                put_page(dst, Some(*right));
                put_id(dst, separator)?;
            }
            PageOperation::LeafLoad { high, sequence } => {
                match high {
                    Some(high) => {
                        dst.push(1);
                        put_id(dst, high)?;
                    }
                    None => dst.push(0),
                }
                let len = u32::try_from(sequence.len()).map_err(|_| ArborError::Invalid("sequence too long to log"))?;
                dst.extend_from_slice(&len.to_be_bytes());
                dst.extend_from_slice(sequence);
            }
            PageOperation::LeafUnchain { prev, next } | PageOperation::LeafLink { prev, next } => {
                put_page(dst, *prev);
                put_page(dst, *next);
            }
            PageOperation::SetLowChild { before, after } => {
                put_page(dst, *before);
                put_page(dst, *after);
            }
            PageOperation::BranchInsert { key, value } | PageOperation::BranchDelete { key, value } => {
                put_id(dst, key)?;
                put_value(dst, value)?;
            }
            PageOperation::BranchUpdate { key, before, after } => {
                put_id(dst, key)?;
                put_value(dst, before)?;
                put_value(dst, after)?;
            }
        }
        Ok(())
    }

    /// Encodes the record into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decodes a record produced by [`LogRecord::encode_into`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(src);
        let tx = TxId(reader.u64()?);
        let page = PageId(reader.u64()?);
        let op = match reader.u8()? {
            1 => PageOperation::Format {
                kind: PageKind::try_from(reader.u8()?)?,
            },
            2 => PageOperation::LeafInsert {
                id: get_id(&mut reader)?,
                value: get_value(&mut reader)?,
            },
            3 => PageOperation::LeafUpdate {
                id: get_id(&mut reader)?,
                before: get_value(&mut reader)?,
                after: get_value(&mut reader)?,
            },
            4 => {
                let count = reader.u32()? as usize;
                let mut nodes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    nodes.push((get_id(&mut reader)?, get_value(&mut reader)?));
                }
                PageOperation::LeafDelete { nodes }
            }
            5 => PageOperation::LeafSplit {
                right: PageId(reader.u64()?),
                separator: get_id(&mut reader)?,
            },
            6 => PageOperation::LeafUnchain {
                prev: PageId::from_raw(reader.u64()?),
                next: PageId::from_raw(reader.u64()?),
            },
            7 => PageOperation::BranchInsert {
                key: get_id(&mut reader)?,
                value: get_value(&mut reader)?,
            },
            8 => PageOperation::BranchUpdate {
                key: get_id(&mut reader)?,
                before: get_value(&mut reader)?,
                after: get_value(&mut reader)?,
            },
            9 => PageOperation::BranchDelete {
                key: get_id(&mut reader)?,
                value: get_value(&mut reader)?,
            },
            10 => PageOperation::BranchSplit {
                right: PageId(reader.u64()?),
                separator: get_id(&mut reader)?,
            },
            11 => PageOperation::LeafLink {
                prev: PageId::from_raw(reader.u64()?),
                next: PageId::from_raw(reader.u64()?),
            },
            12 => PageOperation::SetLowChild {
                before: PageId::from_raw(reader.u64()?),
                after: PageId::from_raw(reader.u64()?),
            },
            13 => {
                let high = match reader.u8()? {
                    0 => None,
                    1 => Some(get_id(&mut reader)?),
                    _ => return Err(ArborError::Corruption("unknown high key flag")),
                };
                let len = reader.u32()? as usize;
                PageOperation::LeafLoad {
                    high,
                    sequence: reader.take(len)?.to_vec(),
                }
            }
            _ => return Err(ArborError::Corruption("unknown log record tag")),
        };
        if !reader.is_empty() {
            return Err(ArborError::Corruption("trailing bytes after log record"));
        }
        Ok(Self { tx, page, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_record_keeps_node_order() -> Result<()> {
        let record = LogRecord {
            tx: TxId(4),
            page: PageId(9),
            op: PageOperation::LeafDelete {
                nodes: vec![
                    (DeweyId::parse("1/2:1.3")?, OwnedValue::Inline(b"a".to_vec())),
                    (DeweyId::parse("1/2:1.3.3")?, OwnedValue::External(PageId(77))),
                ],
            },
        };
        assert_eq!(LogRecord::decode(&record.to_bytes()?)?, record);
        Ok(())
    }

    #[test]
    fn load_record_carries_high_key_and_sequence() -> Result<()> {
        for high in [None, Some(DeweyId::parse("1/2:1.9")?)] {
            let record = LogRecord {
                tx: TxId(3),
                page: PageId(12),
                op: PageOperation::LeafLoad {
                    high,
                    sequence: vec![0, 0, 0, 1, 0, 0, 0, 0, 0],
                },
            };
            assert_eq!(LogRecord::decode(&record.to_bytes()?)?, record);
        }
        Ok(())
    }

    #[test]
    fn rejects_trailing_garbage() -> Result<()> {
        let record = LogRecord {
            tx: TxId(1),
            page: PageId(2),
            op: PageOperation::Format { kind: PageKind::Leaf },
        };
        let mut bytes = record.to_bytes()?;
        bytes.push(0);
        assert!(LogRecord::decode(&bytes).is_err());
        Ok(())
    }
}
