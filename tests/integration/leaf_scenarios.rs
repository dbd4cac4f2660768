#![allow(missing_docs)]

mod support;

use arbor::storage::{BlobDisposal, LatchedContext, NavigationMode, NavigationStatus, OwnedValue, SearchMode, StoreOptions, Tx};
use arbor::types::{DeweyId, Result, TxId};
use support::{append_children, id, root, store};

#[test]
fn insert_between_children_keeps_document_order() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let tx = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    assert!(leaf.insert_after(&tx, &root(), b"doc", false)?);
    for text in ["1/1:1.3", "1/1:1.5", "1/1:1.7"] {
        assert!(leaf.insert_after(&tx, &id(text), text.as_bytes(), false)?);
    }

    assert_eq!(leaf.navigate_to(&id("1/1:1.3"), SearchMode::ToKey)?, NavigationStatus::Found);
    let x = DeweyId::new_child_between(&root(), Some(&id("1/1:1.3")), Some(&id("1/1:1.5")))?;
    assert!(id("1/1:1.3") < x && x < id("1/1:1.5"));
    assert!(leaf.insert_after(&tx, &x, b"x", false)?);
    assert_eq!(leaf.key(), Some(&x));

    assert_eq!(leaf.navigate_to(&root(), SearchMode::ToKey)?, NavigationStatus::Found);
    let mut walked = Vec::new();
    assert_eq!(leaf.navigate(NavigationMode::FirstChild)?, NavigationStatus::Found);
    walked.push(leaf.key().cloned().expect("positioned"));
    while leaf.navigate(NavigationMode::NextSibling)? == NavigationStatus::Found {
        walked.push(leaf.key().cloned().expect("positioned"));
    }
    assert_eq!(walked, vec![id("1/1:1.3"), x.clone(), id("1/1:1.5"), id("1/1:1.7")]);

    assert_eq!(leaf.navigate_to(&x, SearchMode::ToKey)?, NavigationStatus::Found);
    assert_eq!(leaf.value()?, b"x".to_vec());
    assert_eq!(leaf.navigate(NavigationMode::Parent)?, NavigationStatus::Found);
    assert_eq!(leaf.key(), Some(&root()));
    leaf.page()?.check()?;
    Ok(())
}

#[test]
fn externalization_starts_above_threshold() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let threshold = store.factory.options().effective_inline_threshold();
    let tx = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    assert!(leaf.insert_after(&tx, &root(), b"", false)?);

    let at = vec![0x11u8; threshold];
    let above = vec![0x22u8; threshold + 1];
    assert!(leaf.insert_after(&tx, &id("1/1:1.3"), &at, false)?);
    assert!(matches!(leaf.stored_value()?, OwnedValue::Inline(_)));
    assert!(leaf.insert_after(&tx, &id("1/1:1.5"), &above, false)?);
    assert!(matches!(leaf.stored_value()?, OwnedValue::External(_)));

    assert_eq!(leaf.navigate_to(&id("1/1:1.3"), SearchMode::ToKey)?, NavigationStatus::Found);
    assert_eq!(leaf.value()?, at);
    assert_eq!(leaf.navigate_to(&id("1/1:1.5"), SearchMode::ToKey)?, NavigationStatus::Found);
    assert_eq!(leaf.value()?, above);
    assert_eq!(store.factory.stats().externalized_values, 1);
    let blobs = store.blobs.stats();
    assert_eq!(blobs.pages_allocated - blobs.pages_freed, 1);
    Ok(())
}

#[test]
fn replacing_external_value_defers_blob_release() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let threshold = store.factory.options().effective_inline_threshold();
    let tx = Tx::new(TxId(3));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    assert!(leaf.insert_after(&tx, &root(), &vec![1u8; threshold * 3], false)?);
    let OwnedValue::External(blob) = leaf.stored_value()? else {
        panic!("value should be external");
    };

    let mut pending = Vec::new();
    assert!(leaf.set_value(&tx, b"small", false, BlobDisposal::Deferred(&mut pending))?);
    assert_eq!(pending, vec![blob]);
    assert_eq!(leaf.value()?, b"small".to_vec());
    assert_eq!(store.factory.stats().dropped_blobs, 0);
    Ok(())
}

#[test]
fn full_page_rejects_insert_without_side_effects() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(1024))?;
    let threshold = store.factory.options().effective_inline_threshold();
    let tx = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    assert!(leaf.insert_after(&tx, &root(), b"", false)?);
    let ids = append_children(&mut leaf, &tx, 64, threshold)?;
    assert!(ids.len() > 2 && ids.len() < 64, "page should fill up");

    let before = leaf.page()?.as_bytes().to_vec();
    let free = leaf.page()?.free_space();
    let next = DeweyId::new_child_between(&root(), ids.last(), None)?;
    assert!(!leaf.insert_after(&tx, &next, &vec![7u8; threshold], false)?);
    assert_eq!(leaf.page()?.as_bytes(), &before[..]);
    assert_eq!(leaf.page()?.free_space(), free);
    assert_eq!(store.blobs.stats().pages_allocated, 0);
    Ok(())
}

#[test]
fn delete_prepare_is_a_dry_run() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(4096))?;
    let threshold = store.factory.options().effective_inline_threshold();
    let tx = Tx::new(TxId(1));
    let mut leaf = store.factory.allocate_leaf(&tx, false)?;
    assert!(leaf.insert_after(&tx, &root(), b"", false)?);
    for (text, len) in [("1/1:1.3", 4), ("1/1:1.3.3", threshold + 10), ("1/1:1.3.3.5", 4), ("1/1:1.5", 4)] {
        assert!(leaf.insert_after(&tx, &id(text), &vec![1u8; len], false)?);
    }

    assert_eq!(leaf.navigate_to(&id("1/1:1.3"), SearchMode::ToKey)?, NavigationStatus::Found);
    let before = leaf.page()?.as_bytes().to_vec();
    let mut visited = 0;
    let plan = leaf.delete_prepare(|_| {
        visited += 1;
        Ok(())
    })?;
    assert_eq!(plan.nodes(), 3);
    assert!(visited >= 3);
    assert_eq!(plan.externals().len(), 1);
    assert_eq!(leaf.page()?.as_bytes(), &before[..]);

    let outcome = leaf.delete(&tx, plan, false, BlobDisposal::Immediate)?.expect("delete fits");
    assert_eq!(outcome.removed, 3);
    assert_eq!(leaf.key(), Some(&id("1/1:1.5")));
    let remaining: Vec<_> = leaf.page()?.entries()?.into_iter().map(|(id, _)| id).collect();
    assert_eq!(remaining, vec![root(), id("1/1:1.5")]);
    assert_eq!(store.factory.stats().dropped_blobs, 1);
    let blobs = store.blobs.stats();
    assert_eq!(blobs.pages_allocated, blobs.pages_freed);
    assert_eq!(leaf.page_id(), leaf.page()?.page_id()?);
    Ok(())
}
