//! Dirty-Page Tracker (§4.4): three flags per storage page — `DIRTY`,
//! `PENDING`, `NEEDWRITE` — and the transition table that drives the daemon
//! and `unplug`.
use std::sync::Mutex;

bitflags::bitflags! {
    pub struct PageAttr: u8 {
        const DIRTY     = 0b001;
        const PENDING   = 0b010;
        const NEEDWRITE = 0b100;
    }
}

pub struct AttrTable {
    attrs: Mutex<Vec<PageAttr>>,
}

impl AttrTable {
    pub fn new(pages: usize) -> Self {
        Self {
            attrs: Mutex::new(vec![PageAttr::empty(); pages]),
        }
    }

    pub fn set(&self, page: usize, attr: PageAttr) {
        if let Some(slot) = self.attrs.lock().unwrap().get_mut(page) {
            slot.insert(attr);
        }
    }

    pub fn clear(&self, page: usize, attr: PageAttr) {
        if let Some(slot) = self.attrs.lock().unwrap().get_mut(page) {
            slot.remove(attr);
        }
    }

    pub fn test(&self, page: usize, attr: PageAttr) -> bool {
        self.attrs
            .lock()
            .unwrap()
            .get(page)
            .map(|slot| slot.contains(attr))
            .unwrap_or(false)
    }

    /// Clears `attr` on `page` and reports whether it had been set.
    pub fn test_and_clear(&self, page: usize, attr: PageAttr) -> bool {
        let mut table = self.attrs.lock().unwrap();
        match table.get_mut(page) {
            Some(slot) if slot.contains(attr) => {
                slot.remove(attr);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `file_set_bit`: a page gained a bit that must eventually reach disk.
    pub fn mark_dirty(&self, page: usize) {
        self.set(page, PageAttr::DIRTY);
    }

    /// `file_clear_bit`: a page lost a bit. If it isn't already scheduled
    /// for a write (`NEEDWRITE`), give it a grace period (`PENDING`) instead
    /// of writing immediately — the next daemon tick promotes it.
    /// Returns `true` if the page's clean state actually changed, i.e. the
    /// caller should clear `allclean`.
    pub fn mark_pending_unless_needwrite(&self, page: usize) -> bool {
        let mut table = self.attrs.lock().unwrap();
        match table.get_mut(page) {
            Some(slot) if !slot.contains(PageAttr::NEEDWRITE) => {
                slot.insert(PageAttr::PENDING);
                true
            }
            _ => false,
        }
    }

    /// Daemon step 1: promote every PENDING page to NEEDWRITE.
    pub fn promote_pending_to_needwrite(&self) {
        let mut table = self.attrs.lock().unwrap();
        for slot in table.iter_mut() {
            if slot.contains(PageAttr::PENDING) {
                slot.remove(PageAttr::PENDING);
                slot.insert(PageAttr::NEEDWRITE);
            }
        }
    }
}
