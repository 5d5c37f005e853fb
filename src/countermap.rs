//! Counter Map (§4.2): the logical "chunks × counter" view built on top of
//! the Page Pool. Resolves a sector offset to the counter cell covering it.
use std::sync::{Arc, Mutex};

use crate::consts::{PAGE_COUNTER_MASK, PAGE_COUNTER_SHIFT, COUNTER_BYTE_SHIFT};
use crate::counter::Counter;
use crate::error::BitmapError;
use crate::host::PageAllocator;
use crate::pagepool::{checkfree, checkpage, PoolState, Slot};

pub struct CounterMap {
    chunkshift: u32,
    chunks: u64,
    pool: Mutex<PoolState>,
    allocator: Arc<dyn PageAllocator>,
}

impl CounterMap {
    pub fn new(chunkshift: u32, chunks: u64, allocator: Arc<dyn PageAllocator>) -> Self {
        let pages = pages_for_chunks(chunks);
        Self {
            chunkshift,
            chunks,
            pool: Mutex::new(PoolState::new(pages)),
            allocator,
        }
    }

    pub fn chunkshift(&self) -> u32 {
        self.chunkshift
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn chunk_size_sectors(&self) -> u64 {
        1u64 << self.chunkshift
    }

    pub fn pages(&self) -> usize {
        self.pool.lock().unwrap().pages()
    }

    pub fn missing_pages(&self) -> usize {
        self.pool.lock().unwrap().missing_pages
    }

    pub fn allocated_pages(&self) -> usize {
        self.pool.lock().unwrap().allocated_pages()
    }

    /// Resolves `offset` (a sector within the mapped device) to its owning
    /// counter and invokes `f` with `(&mut counter, blocks)` while the pool
    /// lock is held, mirroring `bitmap_get_counter`'s "now locked..."
    /// contract: the whole read-modify-write the caller performs on the
    /// counter happens atomically with respect to every other counter
    /// mutator.
    ///
    /// Returns `Err` only when `create` is false and the page is not
    /// resident, or the offset is past the end of the map.
    pub fn with_counter_mut<R>(
        &self,
        offset: u64,
        create: bool,
        f: impl FnOnce(&mut Counter, u64) -> R,
    ) -> Result<R, BitmapError> {
        let chunk = offset >> self.chunkshift;
        let page = (chunk >> PAGE_COUNTER_SHIFT) as usize;
        let pageoff = ((chunk as usize) & PAGE_COUNTER_MASK) << COUNTER_BYTE_SHIFT;

        checkpage(&self.pool, self.allocator.as_ref(), page, create)?;

        let mut guard = self.pool.lock().unwrap();
        let pages = guard.slots.len();
        let meta = guard
            .slots
            .get_mut(page)
            .ok_or(BitmapError::NoSuchPage { index: page, pages })?;

        let csize: u64 = if meta.slot.is_hijacked() || meta.slot.is_empty() {
            1u64 << (self.chunkshift + PAGE_COUNTER_SHIFT - 1)
        } else {
            1u64 << self.chunkshift
        };
        let blocks = csize - (offset & (csize - 1));

        match &mut meta.slot {
            Slot::Empty => Err(BitmapError::Busy {
                reason: format!("page {} not resident and create=false", page),
            }),
            Slot::Hijacked(counters) => {
                let hi = pageoff > PAGE_COUNTER_MASK;
                Ok(f(&mut counters[hi as usize], blocks))
            }
            Slot::Allocated(counters) => {
                let index = (chunk as usize) & PAGE_COUNTER_MASK;
                Ok(f(&mut counters[index], blocks))
            }
        }
    }

    /// `blocks` a caller would get back from a failed lookup -- used by
    /// callers that want the coarse span without touching the counter
    /// (e.g. to skip ahead after a `NotFound`).
    pub fn fallback_blocks(&self) -> u64 {
        1u64 << (self.chunkshift + PAGE_COUNTER_SHIFT - 1)
    }

    pub fn count_page(&self, offset: u64, inc: i64) {
        let chunk = offset >> self.chunkshift;
        let page = (chunk >> PAGE_COUNTER_SHIFT) as usize;
        let mut guard = self.pool.lock().unwrap();
        if let Some(meta) = guard.slots.get_mut(page) {
            meta.count = (meta.count as i64 + inc).max(0) as u32;
        }
        checkfree(&mut guard, page);
    }

    pub fn set_pending(&self, offset: u64) {
        let chunk = offset >> self.chunkshift;
        let page = (chunk >> PAGE_COUNTER_SHIFT) as usize;
        let mut guard = self.pool.lock().unwrap();
        if let Some(meta) = guard.slots.get_mut(page) {
            meta.pending = true;
        }
    }

    pub fn page_pending(&self, page: usize) -> bool {
        self.pool
            .lock()
            .unwrap()
            .slots
            .get(page)
            .map(|m| m.pending)
            .unwrap_or(false)
    }

    pub fn take_page_pending(&self, page: usize) -> bool {
        let mut guard = self.pool.lock().unwrap();
        match guard.slots.get_mut(page) {
            Some(meta) if meta.pending => {
                meta.pending = false;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of one counter, for read-only inspection (status reporting,
    /// tests). Does not allocate.
    pub fn peek_counter(&self, offset: u64) -> Option<Counter> {
        self.with_counter_mut(offset, false, |c, _| *c).ok()
    }

    /// The `blocks` span `get_counter` would report for `offset`, without
    /// mutating anything -- the coarse hijacked-page span when the owning
    /// page is hijacked, `fallback_blocks()` when it isn't resident at all.
    pub fn blocks_for(&self, offset: u64) -> u64 {
        self.with_counter_mut(offset, false, |_, blocks| blocks)
            .unwrap_or_else(|_| self.fallback_blocks())
    }

    /// Whether the page covering `offset` is currently a hijacked slot
    /// (§4.1, §8 Scenario F) rather than a real allocated counter page.
    pub fn is_page_hijacked(&self, offset: u64) -> bool {
        let chunk = offset >> self.chunkshift;
        let page = (chunk >> PAGE_COUNTER_SHIFT) as usize;
        self.pool
            .lock()
            .unwrap()
            .slots
            .get(page)
            .map(|meta| meta.slot.is_hijacked())
            .unwrap_or(false)
    }
}

pub fn pages_for_chunks(chunks: u64) -> usize {
    let ratio = crate::consts::PAGE_COUNTER_RATIO as u64;
    (((chunks + ratio - 1) / ratio).max(1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reference::SystemAllocator;

    fn map(chunks: u64) -> CounterMap {
        CounterMap::new(12, chunks, Arc::new(SystemAllocator))
    }

    #[test]
    fn get_counter_reports_chunk_aligned_blocks() {
        let m = map(16);
        let blocks = m.with_counter_mut(0, true, |_, blocks| blocks).unwrap();
        assert_eq!(blocks, 1 << 12);

        // Offset partway through a chunk: blocks should cover the
        // remainder of that chunk only.
        let partial = m.with_counter_mut(10, true, |_, blocks| blocks).unwrap();
        assert_eq!(partial, (1 << 12) - 10);
    }

    #[test]
    fn count_page_and_checkfree_release_page_when_idle() {
        let m = map(16);
        m.with_counter_mut(0, true, |c, _| c.set_count(1)).unwrap();
        m.count_page(0, 1);
        assert_eq!(m.missing_pages(), 0);
        m.count_page(0, -1);
        assert_eq!(m.missing_pages(), 1);
    }

    #[test]
    fn set_pending_is_observed_on_owning_page() {
        let m = map(16);
        m.with_counter_mut(0, true, |_, _| ()).unwrap();
        assert!(!m.page_pending(0));
        m.set_pending(0);
        assert!(m.page_pending(0));
        assert!(m.take_page_pending(0));
        assert!(!m.page_pending(0));
    }
}
