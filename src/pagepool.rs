//! Page Pool / Counter Pages (§4.1): a flat array of page slots, each
//! holding either an allocated counter page or, when allocation failed, a
//! hijacked inline pair of counters living in the slot itself.
use std::sync::Mutex;

use crate::consts::PAGE_COUNTER_RATIO;
use crate::counter::Counter;
use crate::deps::log::{debug, warn};
use crate::error::BitmapError;
use crate::host::PageAllocator;

/// A page's worth of packed counters. `PAGE_COUNTER_RATIO` consecutive
/// chunks live in one such page.
pub type CounterPage = Box<[Counter]>;

/// `hijacked ⇒ map = null` is expressed here as a sum type instead of a
/// nullable pointer with a side flag (§9 Design Notes): there is no state in
/// which both an allocated page and hijacked counters exist for one slot.
pub enum Slot {
    Empty,
    Allocated(CounterPage),
    Hijacked([Counter; 2]),
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    pub fn is_hijacked(&self) -> bool {
        matches!(self, Slot::Hijacked(_))
    }
}

pub struct PageSlotMeta {
    pub slot: Slot,
    /// Chunks on this page with a non-zero counter; drives `checkfree`.
    pub count: u32,
    /// Hint that some counter on this page may need daemon attention.
    pub pending: bool,
}

impl PageSlotMeta {
    fn empty() -> Self {
        Self {
            slot: Slot::Empty,
            count: 0,
            pending: false,
        }
    }
}

pub struct PoolState {
    pub slots: Vec<PageSlotMeta>,
    pub missing_pages: usize,
}

impl PoolState {
    pub fn new(pages: usize) -> Self {
        Self {
            slots: (0..pages).map(|_| PageSlotMeta::empty()).collect(),
            missing_pages: pages,
        }
    }

    pub fn pages(&self) -> usize {
        self.slots.len()
    }

    /// Invariant #3: `missing_pages + allocated_pages == pages`.
    pub fn allocated_pages(&self) -> usize {
        self.slots.iter().filter(|s| !s.slot.is_empty()).count()
    }

    fn new_counter_page() -> CounterPage {
        vec![Counter::ZERO; PAGE_COUNTER_RATIO].into_boxed_slice()
    }
}

/// Ensures `pool.slots[page_index]` is ready for counter access, allocating
/// (or hijacking) it if necessary. Callers must hold `pool` locked on entry;
/// this function may drop and reacquire the lock while allocating, so any
/// slot state the caller cached across the call is a stale witness and must
/// be re-read (§4.1, §9 Design Notes).
pub fn checkpage(
    pool: &Mutex<PoolState>,
    allocator: &dyn PageAllocator,
    page_index: usize,
    create: bool,
) -> Result<(), BitmapError> {
    {
        let guard = pool.lock().unwrap();
        if page_index >= guard.slots.len() {
            return Err(BitmapError::NoSuchPage {
                index: page_index,
                pages: guard.slots.len(),
            });
        }
        if !guard.slots[page_index].slot.is_empty() {
            return Ok(());
        }
        if !create {
            return Err(BitmapError::Busy {
                reason: format!("page {} not allocated and create=false", page_index),
            });
        }
    }

    // Drop the lock before allocating: allocation must never happen while
    // holding the counter lock (§5's no-sleep-on-the-data-path rule).
    let allocated = allocator.alloc_zeroed_page();

    let mut guard = pool.lock().unwrap();
    match allocated {
        None => {
            if guard.slots[page_index].slot.is_empty() {
                warn!("page {} allocation failed, hijacking slot", page_index);
                guard.slots[page_index].slot = Slot::Hijacked([Counter::ZERO; 2]);
            }
            // else: someone else installed a page (or hijacked it) while we
            // were allocating; nothing to do, our failure is moot.
        }
        Some(bytes) => {
            if guard.slots[page_index].slot.is_empty() {
                debug_assert_eq!(bytes.len(), crate::consts::PAGE_SIZE);
                guard.slots[page_index].slot = Slot::Allocated(PoolState::new_counter_page());
                guard.missing_pages -= 1;
                debug!("page {} allocated", page_index);
            }
            // else: another thread won the race; `bytes` is simply dropped,
            // which is this implementation's form of "free the new page".
        }
    }
    Ok(())
}

/// Releases a slot whose `count` has dropped to zero. A hijacked slot
/// reverts to `Empty` (clearing the hijack so the next `checkpage` may try
/// a real allocation again); an allocated slot is freed and `missing_pages`
/// incremented.
pub fn checkfree(pool: &mut PoolState, page_index: usize) {
    let meta = match pool.slots.get_mut(page_index) {
        Some(meta) => meta,
        None => return,
    };
    if meta.count != 0 {
        return;
    }
    match meta.slot {
        Slot::Empty => {}
        Slot::Hijacked(_) => {
            meta.slot = Slot::Empty;
        }
        Slot::Allocated(_) => {
            meta.slot = Slot::Empty;
            pool.missing_pages += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reference::{FailingAllocator, SystemAllocator};

    #[test]
    fn checkpage_without_create_fails_on_empty_slot() {
        let pool = Mutex::new(PoolState::new(4));
        let allocator = SystemAllocator;
        let err = checkpage(&pool, &allocator, 0, false);
        assert!(err.is_err());
    }

    #[test]
    fn checkpage_allocates_and_tracks_missing_pages() {
        let pool = Mutex::new(PoolState::new(4));
        let allocator = SystemAllocator;
        checkpage(&pool, &allocator, 2, true).unwrap();
        let guard = pool.lock().unwrap();
        assert!(matches!(guard.slots[2].slot, Slot::Allocated(_)));
        assert_eq!(guard.missing_pages, 3);
        assert_eq!(guard.allocated_pages(), 1);
    }

    #[test]
    fn checkpage_hijacks_on_allocation_failure() {
        let pool = Mutex::new(PoolState::new(4));
        let allocator = FailingAllocator::new(1);
        checkpage(&pool, &allocator, 1, true).unwrap();
        let guard = pool.lock().unwrap();
        assert!(guard.slots[1].slot.is_hijacked());
        // missing_pages is untouched: a hijacked slot never counted as
        // "missing" a real page in the first place, it just never had one.
        assert_eq!(guard.missing_pages, 4);
    }

    #[test]
    fn checkfree_reverts_hijacked_slot_to_empty_for_retry() {
        let mut pool = PoolState::new(2);
        pool.slots[0].slot = Slot::Hijacked([Counter::ZERO; 2]);
        pool.slots[0].count = 0;
        checkfree(&mut pool, 0);
        assert!(pool.slots[0].slot.is_empty());
    }

    #[test]
    fn checkfree_leaves_nonzero_count_slots_alone() {
        let mut pool = PoolState::new(2);
        pool.slots[0].slot = Slot::Allocated(PoolState::new_counter_page());
        pool.slots[0].count = 1;
        pool.missing_pages -= 1;
        checkfree(&mut pool, 0);
        assert!(!pool.slots[0].slot.is_empty());
    }

    #[test]
    fn missing_plus_allocated_equals_total_pages() {
        let pool = Mutex::new(PoolState::new(8));
        let allocator = SystemAllocator;
        for idx in [0usize, 3, 7] {
            checkpage(&pool, &allocator, idx, true).unwrap();
        }
        let guard = pool.lock().unwrap();
        assert_eq!(guard.missing_pages + guard.allocated_pages(), guard.pages());
    }
}
