#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use tracing::{debug, trace};

use crate::types::{ArborError, PageId, Result};

/// Latch modes a fixed page can be held in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Shared; any number of readers.
    Shared,
    /// Update; coexists with readers and can be upgraded to exclusive.
    Update,
    /// Exclusive; required for mutation.
    Exclusive,
}

/// RAII guard over a frame in one of the [`LatchMode`]s.
pub enum PageLatch {
    /// Shared guard.
    Shared(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    /// Upgradable guard.
    Update(ArcRwLockUpgradableReadGuard<RawRwLock, Box<[u8]>>),
    /// Exclusive guard.
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

impl PageLatch {
    fn acquire(buf: &Arc<RwLock<Box<[u8]>>>, mode: LatchMode) -> Self {
        match mode {
            LatchMode::Shared => PageLatch::Shared(buf.read_arc()),
            LatchMode::Update => PageLatch::Update(buf.upgradable_read_arc()),
            LatchMode::Exclusive => PageLatch::Exclusive(buf.write_arc()),
        }
    }

    /// Mode this guard holds.
    pub fn mode(&self) -> LatchMode {
        match self {
            PageLatch::Shared(_) => LatchMode::Shared,
            PageLatch::Update(_) => LatchMode::Update,
            PageLatch::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// Page bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            PageLatch::Shared(guard) => &guard[..],
            PageLatch::Update(guard) => &guard[..],
            PageLatch::Exclusive(guard) => &guard[..],
        }
    }

    /// Mutable page bytes; only available under an exclusive latch.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            PageLatch::Exclusive(guard) => Ok(&mut guard[..]),
            _ => Err(ArborError::Latch("mutation requires an exclusive latch")),
        }
    }
}

impl fmt::Debug for PageLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PageLatch").field(&self.mode()).finish()
    }
}

struct Frame {
    buf: Arc<RwLock<Box<[u8]>>>,
    pins: AtomicU32,
    deleted: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            pins: AtomicU32::new(0),
            deleted: AtomicBool::new(false),
        }
    }
}

/// A fixed (pinned) page, optionally latched.
///
/// Dropping the handle releases the latch and then the pin.
pub struct PageHandle {
    id: PageId,
    frame: Arc<Frame>,
    latch: Option<PageLatch>,
}

impl PageHandle {
    fn new(id: PageId, frame: Arc<Frame>, mode: LatchMode) -> Self {
        frame.pins.fetch_add(1, Ordering::AcqRel);
        let latch = PageLatch::acquire(&frame.buf, mode);
        Self {
            id,
            frame,
            latch: Some(latch),
        }
    }

    /// Page id.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Current latch mode, `None` once unlatched.
    pub fn mode(&self) -> Option<LatchMode> {
        self.latch.as_ref().map(PageLatch::mode)
    }

    /// True while a latch is held.
    pub fn is_latched(&self) -> bool {
        self.latch.is_some()
    }

    /// Page bytes under the current latch.
    pub fn bytes(&self) -> Result<&[u8]> {
        self.latch
            .as_ref()
            .map(PageLatch::bytes)
            .ok_or(ArborError::Latch("page is not latched"))
    }

    /// Mutable page bytes; requires an exclusive latch.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.latch
            .as_mut()
            .ok_or(ArborError::Latch("page is not latched"))?
            .bytes_mut()
    }

    /// Re-latches an unlatched handle.
    pub fn latch(&mut self, mode: LatchMode) -> Result<()> {
        if self.latch.is_some() {
            return Err(ArborError::Latch("page is already latched"));
        }
        self.latch = Some(PageLatch::acquire(&self.frame.buf, mode));
        Ok(())
    }

    /// Releases the latch but keeps the page fixed. Calling it again is a no-op.
    pub fn unlatch(&mut self) {
        self.latch = None;
    }

    /// Upgrades an update latch to exclusive. Exclusive latches are left as is.
    pub fn upgrade(&mut self) -> Result<()> {
        match self.latch.take() {
            Some(PageLatch::Update(guard)) => {
                self.latch = Some(PageLatch::Exclusive(ArcRwLockUpgradableReadGuard::upgrade(guard)));
                Ok(())
            }
            Some(latch @ PageLatch::Exclusive(_)) => {
                self.latch = Some(latch);
                Ok(())
            }
            Some(latch) => {
                self.latch = Some(latch);
                Err(ArborError::Latch("only update latches can be upgraded"))
            }
            None => Err(ArborError::Latch("page is not latched")),
        }
    }

    /// Downgrades an exclusive latch to update mode.
    pub fn downgrade(&mut self) -> Result<()> {
        match self.latch.take() {
            Some(PageLatch::Exclusive(guard)) => {
                self.latch = Some(PageLatch::Update(ArcRwLockWriteGuard::downgrade_to_upgradable(guard)));
                Ok(())
            }
            Some(latch) => {
                self.latch = Some(latch);
                Err(ArborError::Latch("only exclusive latches can be downgraded"))
            }
            None => Err(ArborError::Latch("page is not latched")),
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.latch = None;
        self.frame.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("id", &self.id)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Fixed-size page buffer consumed by the page-context layer.
pub trait PageBuffer: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;
    /// Allocates a zeroed page and returns it fixed under an exclusive latch.
    fn allocate(&self) -> Result<PageHandle>;
    /// Fixes an existing page under `mode`.
    fn fix(&self, page: PageId, mode: LatchMode) -> Result<PageHandle>;
    /// Marks a page deleted. The frame is reclaimed once no handle pins it.
    fn delete_deferred(&self, page: PageId) -> Result<()>;
}

/// Counters reported by [`MemoryBuffer::stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferStats {
    /// Pages currently addressable.
    pub live_pages: usize,
    /// Pages marked deleted and not yet reclaimed.
    pub pending_deletes: usize,
    /// Reclaimed ids waiting for reuse.
    pub free_ids: usize,
}

#[derive(Default)]
struct BufferState {
    frames: HashMap<PageId, Arc<Frame>>,
    pending: Vec<PageId>,
    free: Vec<PageId>,
}

/// In-memory [`PageBuffer`].
pub struct MemoryBuffer {
    page_size: usize,
    next_page: AtomicU64,
    state: Mutex<BufferState>,
}

impl MemoryBuffer {
    /// Creates an empty buffer of `page_size`-byte pages.
    pub fn new(page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(ArborError::Invalid("page size must be non-zero"));
        }
        Ok(Self {
            page_size,
            next_page: AtomicU64::new(1),
            state: Mutex::new(BufferState::default()),
        })
    }

    /// Reclaims deleted pages that are no longer pinned and returns how many
    /// were freed.
    pub fn release_deferred(&self) -> usize {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        let mut released = 0;
        for page in pending {
            let pinned = state
                .frames
                .get(&page)
                .map_or(false, |frame| frame.pins.load(Ordering::Acquire) > 0);
            if pinned {
                state.pending.push(page);
                continue;
            }
            state.frames.remove(&page);
            state.free.push(page);
            released += 1;
        }
        trace!(released, "buffer.release_deferred");
        released
    }

    /// Current counters.
    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            live_pages: state.frames.len() - state.pending.len(),
            pending_deletes: state.pending.len(),
            free_ids: state.free.len(),
        }
    }
}

impl PageBuffer for MemoryBuffer {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> Result<PageHandle> {
        let frame = Arc::new(Frame::new(self.page_size));
        let id = {
            let mut state = self.state.lock();
            let id = match state.free.pop() {
                Some(id) => id,
                None => PageId(self.next_page.fetch_add(1, Ordering::Relaxed)),
            };
            state.frames.insert(id, Arc::clone(&frame));
            id
        };
        debug!(page = id.0, "buffer.allocate");
        Ok(PageHandle::new(id, frame, LatchMode::Exclusive))
    }

    fn fix(&self, page: PageId, mode: LatchMode) -> Result<PageHandle> {
        let frame = {
            let state = self.state.lock();
            match state.frames.get(&page) {
                Some(frame) if !frame.deleted.load(Ordering::Acquire) => Arc::clone(frame),
                _ => return Err(ArborError::NotFound.at_page(page)),
            }
        };
        trace!(page = page.0, mode = ?mode, "buffer.fix");
        Ok(PageHandle::new(page, frame, mode))
    }

    fn delete_deferred(&self, page: PageId) -> Result<()> {
        let mut state = self.state.lock();
        let frame = state
            .frames
            .get(&page)
            .ok_or_else(|| ArborError::NotFound.at_page(page))?;
        if frame.deleted.swap(true, Ordering::AcqRel) {
            return Err(ArborError::Invalid("page already deleted").at_page(page));
        }
        state.pending.push(page);
        debug!(page = page.0, "buffer.delete_deferred");
        Ok(())
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("page_size", &self.page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_exclusive_zeroed_page() -> Result<()> {
        let buffer = MemoryBuffer::new(256)?;
        let mut page = buffer.allocate()?;
        assert_eq!(page.mode(), Some(LatchMode::Exclusive));
        assert!(page.bytes()?.iter().all(|b| *b == 0));
        page.bytes_mut()?[0] = 7;
        let id = page.id();
        drop(page);
        let page = buffer.fix(id, LatchMode::Shared)?;
        assert_eq!(page.bytes()?[0], 7);
        Ok(())
    }

    #[test]
    fn latch_transitions() -> Result<()> {
        let buffer = MemoryBuffer::new(128)?;
        let id = buffer.allocate()?.id();
        let mut page = buffer.fix(id, LatchMode::Update)?;
        assert!(page.bytes_mut().is_err());
        let reader = buffer.fix(id, LatchMode::Shared)?;
        drop(reader);
        page.upgrade()?;
        page.bytes_mut()?[3] = 1;
        page.downgrade()?;
        assert_eq!(page.mode(), Some(LatchMode::Update));
        page.unlatch();
        page.unlatch();
        assert!(page.bytes().is_err());
        page.latch(LatchMode::Shared)?;
        assert!(page.upgrade().is_err());
        assert_eq!(page.bytes()?[3], 1);
        Ok(())
    }

    #[test]
    fn deferred_delete_waits_for_pins() -> Result<()> {
        let buffer = MemoryBuffer::new(128)?;
        let id = buffer.allocate()?.id();
        let pinned = buffer.fix(id, LatchMode::Shared)?;
        buffer.delete_deferred(id)?;
        assert!(buffer.fix(id, LatchMode::Shared).is_err());
        assert_eq!(buffer.release_deferred(), 0);
        drop(pinned);
        assert_eq!(buffer.release_deferred(), 1);
        assert_eq!(buffer.allocate()?.id(), id);
        Ok(())
    }
}
