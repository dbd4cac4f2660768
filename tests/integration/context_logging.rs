#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use arbor::primitives::buffer::LatchMode;
use arbor::primitives::log::{FileLog, LogKind, LogRecord, PageOperation};
use arbor::storage::{
    BlobDisposal, BracketLeaf, LatchedContext, NavigationStatus, NodeSequence, OwnedValue, SearchMode, SplitAt,
    StoreOptions, Tx,
};
use arbor::types::page::PageKind;
use arbor::types::{ArborError, Lsn, PageId, Result, TxId};
use support::{append_children, id, root, store, store_with_log};
use tempfile::tempdir;

#[test]
fn logged_changes_stamp_page_lsn_and_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("arbor.log");
    let log = Arc::new(FileLog::open(&path)?);
    let store = store_with_log(StoreOptions::new().page_size(4096), log.clone())?;
    let tx = Tx::new(TxId(7));

    let mut leaf = store.factory.allocate_leaf(&tx, true)?;
    assert!(leaf.insert_after(&tx, &root(), b"r", true)?);
    assert!(leaf.insert_after(&tx, &id("1/1:1.3"), b"a", true)?);
    assert!(leaf.set_value(&tx, b"b", true, BlobDisposal::Immediate)?);
    log.sync()?;

    let frames = FileLog::read_all(&path)?;
    assert_eq!(frames.len(), 4);
    assert_eq!(leaf.lsn()?, frames[3].lsn);
    assert!(frames.iter().all(|f| f.kind == LogKind::Update && f.record.tx == TxId(7)));
    assert!(matches!(frames[0].record.op, PageOperation::Format { .. }));
    assert_eq!(
        frames[3].record.op,
        PageOperation::LeafUpdate {
            id: id("1/1:1.3"),
            before: OwnedValue::Inline(b"a".to_vec()),
            after: OwnedValue::Inline(b"b".to_vec()),
        }
    );
    drop(leaf);
    drop(store);
    drop(log);

    let reopened = FileLog::open(&path)?;
    let store = store_with_log(StoreOptions::new().page_size(4096), Arc::new(reopened))?;
    let mut other = store.factory.allocate_leaf(&tx, true)?;
    assert!(other.insert_after(&tx, &root(), b"", true)?);
    assert_eq!(other.lsn()?, Lsn(6));
    assert_eq!(FileLog::read_all(&path)?.len(), 6);
    Ok(())
}

#[test]
fn rollback_writes_chained_compensations() -> Result<()> {
    let (store, log) = store(StoreOptions::new().page_size(4096))?;
    let setup = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&setup, false)?;
    assert!(leaf.insert_after(&setup, &root(), b"root", false)?);

    let tx = Tx::new(TxId(2));
    assert!(leaf.insert_after(&tx, &id("1/1:1.3"), b"one", true)?);
    assert!(leaf.insert_after(&tx, &id("1/1:1.5"), b"two", true)?);
    assert_eq!(leaf.navigate_to(&id("1/1:1.3"), SearchMode::ToKey)?, NavigationStatus::Found);
    assert!(leaf.set_value(&tx, b"changed", true, BlobDisposal::Immediate)?);

    let forward = log.records();
    assert_eq!(forward.len(), 3);
    for (idx, entry) in forward.iter().enumerate().rev() {
        let undo_next = if idx == 0 { Lsn(0) } else { forward[idx - 1].lsn };
        leaf.undo(&tx.rolling_back(undo_next), &entry.record)?;
    }

    assert_eq!(leaf.page()?.entries()?, vec![(root(), OwnedValue::Inline(b"root".to_vec()))]);
    let all = log.records();
    let clrs = &all[3..];
    assert_eq!(clrs.len(), 3);
    assert!(clrs.iter().all(|c| c.kind == LogKind::Compensation));
    let chain: Vec<_> = clrs.iter().map(|c| c.undo_next).collect();
    assert_eq!(chain, vec![Some(forward[1].lsn), Some(forward[0].lsn), Some(Lsn(0))]);
    assert!(matches!(clrs[0].record.op, PageOperation::LeafUpdate { .. }));
    assert!(matches!(clrs[1].record.op, PageOperation::LeafDelete { ref nodes } if nodes.len() == 1));
    assert_eq!(leaf.lsn()?, clrs[2].lsn);
    Ok(())
}

#[test]
fn undo_of_subtree_delete_restores_nodes() -> Result<()> {
    let (store, log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(4));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    let nodes = [("1/1:1", "r"), ("1/1:1.3", "a"), ("1/1:1.3.3", "b"), ("1/1:1.5", "c")];
    for (text, value) in nodes {
        assert!(leaf.insert_after(&tx, &id(text), value.as_bytes(), false)?);
    }
    let before = leaf.page()?.entries()?;

    assert_eq!(leaf.navigate_to(&id("1/1:1.3"), SearchMode::ToKey)?, NavigationStatus::Found);
    let plan = leaf.delete_prepare(|_| Ok(()))?;
    assert!(leaf.delete(&tx, plan, true, BlobDisposal::Immediate)?.is_some());
    let records = log.records();
    let PageOperation::LeafDelete { nodes: removed } = &records[0].record.op else {
        panic!("expected a delete record");
    };
    assert_eq!(removed.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(), vec![id("1/1:1.3"), id("1/1:1.3.3")]);

    leaf.undo(&tx.rolling_back(Lsn(0)), &records[0].record)?;
    assert_eq!(leaf.page()?.entries()?, before);
    Ok(())
}

#[test]
fn split_records_rebuild_the_right_page() -> Result<()> {
    let (store, log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(5));
    let mut left = store.factory.allocate_leaf(&tx, false)?;
    assert!(left.insert_after(&tx, &root(), b"root", false)?);
    append_children(&mut left, &tx, 500, 90)?;
    let split = left.split(&tx, SplitAt::Occupancy, None, true)?;
    let right_id = split.right.page_id();

    let mut image = BracketLeaf::format(vec![0u8; 4096], right_id)?;
    let mut loaded = false;
    for entry in log.records().into_iter().filter(|entry| entry.record.page == right_id) {
        match entry.record.op {
            PageOperation::Format { kind } => assert_eq!(kind, PageKind::Leaf),
            PageOperation::LeafLoad { high, sequence } => {
                assert!(image.set_high_key(high.as_ref())?);
                assert!(image.append_sequence(&NodeSequence::from_bytes(&sequence)?)?);
                loaded = true;
            }
            PageOperation::LeafLink { prev, next } => {
                image.set_prev_page(prev);
                image.set_next_page(next);
            }
            other => panic!("unexpected record on the new page: {other:?}"),
        }
    }
    assert!(loaded);

    let right = split.right.page()?;
    assert_eq!(image.entries()?, right.entries()?);
    assert_eq!(image.high_key()?, right.high_key()?);
    assert_eq!(image.prev_page(), Some(left.page_id()));
    assert_eq!(image.next_page(), right.next_page());
    Ok(())
}

#[test]
fn undo_rejects_foreign_records() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    let foreign = LogRecord {
        tx: TxId(1),
        page: PageId(leaf.page_id().0 + 100),
        op: PageOperation::LeafLink { prev: None, next: None },
    };
    assert!(leaf.undo(&tx, &foreign).is_err());
    assert!(leaf.undo(&tx.rolling_back(Lsn(1)), &foreign).is_err());
    Ok(())
}

#[test]
fn latch_modes_gate_mutation() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(1));
    let page = store.factory.allocate_leaf(&tx, false)?.page_id();

    let mut leaf = store.factory.fetch_leaf(page, LatchMode::Update)?;
    assert_eq!(leaf.latch_mode(), Some(LatchMode::Update));
    assert!(matches!(leaf.insert_after(&tx, &root(), b"", false), Err(ArborError::Latch(_))));
    leaf.upgrade()?;
    assert_eq!(leaf.latch_mode(), Some(LatchMode::Exclusive));
    assert!(leaf.insert_after(&tx, &root(), b"", false)?);
    leaf.downgrade()?;
    assert_eq!(leaf.latch_mode(), Some(LatchMode::Update));
    assert_eq!(leaf.value()?, Vec::<u8>::new());
    leaf.unlatch();
    leaf.unlatch();
    assert_eq!(leaf.latch_mode(), None);
    assert!(matches!(leaf.value(), Err(ArborError::Latch(_))));
    drop(leaf);

    let mut shared = store.factory.fetch_leaf(page, LatchMode::Shared)?;
    assert!(matches!(shared.upgrade(), Err(ArborError::Latch(_))));
    assert_eq!(shared.latch_mode(), Some(LatchMode::Shared));
    Ok(())
}
