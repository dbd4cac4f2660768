#![allow(missing_docs)]

mod support;

use arbor::primitives::buffer::LatchMode;
use arbor::storage::{
    BlobDisposal, LatchedContext, LeafContext, NavigationStatus, SearchMode, SplitAt, SplitSide, StoreOptions, Tx,
};
use arbor::types::{ArborError, DeweyId, Result, TxId};
use support::{append_children, root, store, Store};

fn full_leaf(store: &Store, tx: &Tx) -> Result<(LeafContext, Vec<DeweyId>)> {
    let mut leaf = store.factory.allocate_leaf(tx, false)?;
    assert!(leaf.insert_after(tx, &root(), b"root", false)?);
    let ids = append_children(&mut leaf, tx, 500, 90)?;
    assert!(ids.len() < 500, "leaf should fill up");
    Ok((leaf, ids))
}

fn keys(leaf: &LeafContext) -> Result<Vec<DeweyId>> {
    Ok(leaf.page()?.entries()?.into_iter().map(|(id, _)| id).collect())
}

#[test]
fn split_partitions_nodes_around_separator() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(1));
    let (mut left, ids) = full_leaf(&store, &tx)?;
    let original = left.page()?.entries()?;

    let split = left.split(&tx, SplitAt::Occupancy, None, false)?;
    let right = &split.right;

    let mut joined = left.page()?.entries()?;
    joined.extend(right.page()?.entries()?);
    assert_eq!(joined, original);

    let left_keys = keys(&left)?;
    let right_keys = keys(right)?;
    assert!(left_keys.iter().all(|id| *id < split.separator));
    assert_eq!(right_keys.first(), Some(&split.separator));
    assert_eq!(left.high_key()?, Some(split.separator.clone()));
    assert_eq!(right.high_key()?, None);

    let balance = left_keys.len() as f64 / original.len() as f64;
    assert!((0.3..0.7).contains(&balance), "unbalanced split {balance}");

    assert_eq!(left.next_page()?, Some(right.page_id()));
    assert_eq!(right.prev_page()?, Some(left.page_id()));
    assert_eq!(right.next_page()?, None);

    assert_eq!(split.side, SplitSide::Right);
    assert_eq!(split.status, NavigationStatus::Found);
    assert_eq!(right.key(), ids.last());
    assert_eq!(store.factory.stats().leaf_splits, 1);
    left.page()?.check()?;
    right.page()?.check()?;
    Ok(())
}

#[test]
fn split_keeps_addressed_key_on_left() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(1));
    let (mut left, ids) = full_leaf(&store, &tx)?;

    let split = left.split(&tx, SplitAt::Occupancy, Some((&ids[1], SearchMode::ToKey)), false)?;
    assert_eq!(split.side, SplitSide::Left);
    assert_eq!(split.status, NavigationStatus::Found);
    assert_eq!(left.key(), Some(&ids[1]));
    assert!(ids[1] < split.separator);
    Ok(())
}

#[test]
fn nested_split_and_unchain_maintain_sibling_chain() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(2));
    let (mut left, _ids) = full_leaf(&store, &tx)?;
    let first = left.split(&tx, SplitAt::Occupancy, None, false)?;
    let right_id = first.right.page_id();
    drop(first);

    assert!(left.move_first()?);
    let second = left.split(&tx, SplitAt::Cursor, None, false)?;
    let middle_id = second.right.page_id();
    assert_eq!(keys(&left)?, vec![root()]);
    assert_eq!(second.side, SplitSide::Left);
    assert_eq!(left.next_page()?, Some(middle_id));
    assert_eq!(second.right.prev_page()?, Some(left.page_id()));
    assert_eq!(second.right.next_page()?, Some(right_id));
    drop(second);

    let left_id = left.page_id();
    drop(left);
    let right = store.factory.fetch_leaf(right_id, LatchMode::Shared)?;
    assert_eq!(right.prev_page()?, Some(middle_id));
    drop(right);

    let middle = store.factory.fetch_leaf(middle_id, LatchMode::Exclusive)?;
    middle.unchain(&tx, false, BlobDisposal::Immediate)?;

    let left = store.factory.fetch_leaf(left_id, LatchMode::Shared)?;
    let right = store.factory.fetch_leaf(right_id, LatchMode::Shared)?;
    assert_eq!(left.next_page()?, Some(right_id));
    assert_eq!(right.prev_page()?, Some(left_id));
    assert!(matches!(
        store.factory.fetch(middle_id, LatchMode::Shared),
        Err(ArborError::Page { .. }) | Err(ArborError::NotFound)
    ));
    Ok(())
}

#[test]
fn deleting_last_node_requires_unchain() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    assert!(leaf.insert_after(&tx, &root(), b"only", false)?);
    assert!(leaf.move_first()?);
    let plan = leaf.delete_prepare(|_| Ok(()))?;
    assert!(plan.empties_page());
    let err = leaf.delete(&tx, plan, false, BlobDisposal::Immediate).unwrap_err();
    assert!(matches!(err, ArborError::EmptyLeaf(page) if page == leaf.page_id()));
    assert_eq!(keys(&leaf)?, vec![root()]);
    Ok(())
}
