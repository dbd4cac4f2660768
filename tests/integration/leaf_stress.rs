#![allow(missing_docs)]

mod support;

use std::collections::BTreeMap;

use arbor::primitives::buffer::LatchMode;
use arbor::storage::{
    BlobDisposal, LatchedContext, LeafContext, NavigationStatus, SearchMode, SplitAt, SplitSide, StoreOptions, Tx,
};
use arbor::types::{DeweyId, PageId, Result, TxId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use support::{root, store, Store};

const INSERTS: usize = 600;
const DELETES: usize = 250;

/// Fetches the leaf of the chain whose key range holds `key`.
fn locate(store: &Store, head: PageId, key: &DeweyId, mode: SearchMode) -> Result<(LeafContext, NavigationStatus)> {
    let mut page = head;
    loop {
        let mut leaf = store.factory.fetch_leaf(page, LatchMode::Exclusive)?;
        let status = leaf.navigate_to(key, mode)?;
        match (status, leaf.next_page()?) {
            (NavigationStatus::PossiblyFound, Some(next)) => page = next,
            _ => return Ok((leaf, status)),
        }
    }
}

fn children(model: &BTreeMap<DeweyId, Vec<u8>>, parent: &DeweyId) -> Vec<DeweyId> {
    model
        .keys()
        .filter(|id| parent.is_parent_of(id) && !id.is_attribute())
        .cloned()
        .collect()
}

fn scan_chain(store: &Store, head: PageId) -> Result<(Vec<(DeweyId, Vec<u8>)>, usize)> {
    let mut out = Vec::new();
    let mut pages = 0;
    let mut next = Some(head);
    while let Some(page) = next {
        let mut leaf = store.factory.fetch_leaf(page, LatchMode::Shared)?;
        leaf.page()?.check()?;
        pages += 1;
        let mut more = leaf.move_first()?;
        while more {
            out.push((leaf.key().cloned().expect("positioned"), leaf.value()?));
            more = leaf.move_next()?;
        }
        next = leaf.next_page()?;
    }
    Ok((out, pages))
}

#[test]
fn random_inserts_and_deletes_keep_chain_ordered() -> Result<()> {
    let (store, _log) = store(StoreOptions::new().page_size(2048))?;
    let threshold = store.factory.options().effective_inline_threshold();
    let tx = Tx::new(TxId(1));
    let mut rng = ChaCha8Rng::seed_from_u64(0x00A5_B0A5);
    let mut model = BTreeMap::new();

    let head = {
        let mut leaf = store.factory.allocate_leaf(&tx, false)?;
        assert!(leaf.insert_after(&tx, &root(), b"root", false)?);
        leaf.page_id()
    };
    model.insert(root(), b"root".to_vec());

    for _ in 0..INSERTS {
        let parents: Vec<DeweyId> = model.keys().filter(|id| !id.is_attribute()).cloned().collect();
        let parent = &parents[rng.gen_range(0..parents.len())];
        let siblings = children(&model, parent);
        let gap = rng.gen_range(0..=siblings.len());
        let left = gap.checked_sub(1).map(|idx| &siblings[idx]);
        let right = siblings.get(gap);
        let id = DeweyId::new_child_between(parent, left, right)?;
        let value: Vec<u8> = (0..rng.gen_range(0..threshold + 80)).map(|_| rng.gen()).collect();

        let (mut leaf, status) = locate(&store, head, &id, SearchMode::ToInsertPos)?;
        assert_eq!(status, NavigationStatus::Found, "no insert position for {id}");
        if !leaf.insert_after(&tx, &id, &value, false)? {
            let mut split = leaf.split(&tx, SplitAt::Occupancy, Some((&id, SearchMode::ToInsertPos)), false)?;
            assert_eq!(split.status, NavigationStatus::Found);
            let target = match split.side {
                SplitSide::Left => &mut leaf,
                SplitSide::Right => &mut split.right,
            };
            assert!(target.insert_after(&tx, &id, &value, false)?, "insert after split failed for {id}");
        }
        model.insert(id, value);
    }

    let (scanned, pages) = scan_chain(&store, head)?;
    assert!(pages > 4, "expected several leaves, got {pages}");
    assert_eq!(scanned, model.clone().into_iter().collect::<Vec<_>>());

    for _ in 0..DELETES {
        let keys: Vec<&DeweyId> = model.keys().collect();
        let leaves: Vec<DeweyId> = keys
            .iter()
            .enumerate()
            .filter(|(idx, id)| {
                ***id != root() && keys.get(idx + 1).map_or(true, |next| !id.is_ancestor_of(next))
            })
            .map(|(_, id)| (*id).clone())
            .collect();
        let victim = leaves[rng.gen_range(0..leaves.len())].clone();
        let (mut leaf, status) = locate(&store, head, &victim, SearchMode::ToKey)?;
        assert_eq!(status, NavigationStatus::Found, "lost {victim}");
        let plan = leaf.delete_prepare(|_| Ok(()))?;
        assert_eq!(plan.nodes(), 1);
        if plan.empties_page() {
            assert_ne!(leaf.page_id(), head);
            leaf.unchain(&tx, false, BlobDisposal::Immediate)?;
        } else {
            assert!(leaf.delete(&tx, plan, false, BlobDisposal::Immediate)?.is_some());
        }
        model.remove(&victim);
    }

    let (scanned, _) = scan_chain(&store, head)?;
    assert_eq!(scanned, model.into_iter().collect::<Vec<_>>());
    let stats = store.factory.stats();
    assert!(stats.leaf_splits > 0);
    assert!(stats.externalized_values > 0);
    store.factory.stats_handle().emit_tracing();
    store.buffer.release_deferred();
    assert_eq!(store.buffer.stats().pending_deletes, 0);
    Ok(())
}
