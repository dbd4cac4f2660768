#![allow(dead_code)]

use std::sync::{Arc, Once};

use arbor::primitives::blob::OverflowBlobStore;
use arbor::primitives::buffer::MemoryBuffer;
use arbor::primitives::log::{LogFacility, MemoryLog};
use arbor::storage::{LeafContext, PageContextFactory, StoreOptions, Tx};
use arbor::types::{DeweyId, DocId, Result};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Store {
    pub buffer: Arc<MemoryBuffer>,
    pub blobs: Arc<OverflowBlobStore>,
    pub factory: PageContextFactory,
}

pub fn store_with_log(options: StoreOptions, log: Arc<dyn LogFacility>) -> Result<Store> {
    init_tracing();
    let buffer = Arc::new(MemoryBuffer::new(options.page_size)?);
    let blobs = Arc::new(OverflowBlobStore::new(buffer.clone())?);
    let factory = PageContextFactory::new(buffer.clone(), blobs.clone(), log, options)?;
    Ok(Store { buffer, blobs, factory })
}

pub fn store(options: StoreOptions) -> Result<(Store, Arc<MemoryLog>)> {
    let log = Arc::new(MemoryLog::new());
    let store = store_with_log(options, log.clone())?;
    Ok((store, log))
}

pub fn id(text: &str) -> DeweyId {
    DeweyId::parse(text).expect("valid identifier")
}

pub fn root() -> DeweyId {
    DeweyId::document_root(DocId::new(1, 1))
}

/// Appends `count` children of the document root behind the cursor, each
/// carrying `value_len` bytes, and returns their identifiers.
pub fn append_children(leaf: &mut LeafContext, tx: &Tx, count: usize, value_len: usize) -> Result<Vec<DeweyId>> {
    let parent = root();
    let mut ids = Vec::with_capacity(count);
    let mut last: Option<DeweyId> = None;
    for n in 0..count {
        let child = DeweyId::new_child_between(&parent, last.as_ref(), None)?;
        let value = vec![(n % 251) as u8; value_len];
        if !leaf.insert_after(tx, &child, &value, false)? {
            break;
        }
        last = Some(child.clone());
        ids.push(child);
    }
    Ok(ids)
}
