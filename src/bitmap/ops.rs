//! State machine operations (§4.5): `startwrite`/`endwrite` around the data
//! path, `startsync`/`endsync`/`close_sync`/`cond_end_sync` around resync.
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::Bitmap;
use crate::consts::{COUNTER_MAX, PAGE_SIZE, SECTOR_SIZE};
use crate::deps::log::trace;

impl Bitmap {
    /// `bitmap_startwrite` (§4.5): marks every chunk covered by
    /// `[offset, offset+sectors)` in-flight, setting the on-disk bit and
    /// bumping the page refcount the first time a chunk transitions
    /// 0 -> nonzero. Blocks (via the overflow wait queue) while a covered
    /// counter is pinned at `COUNTER_MAX`.
    pub fn startwrite(&self, mut offset: u64, mut sectors: u64, behind: bool) {
        if behind {
            let bw = self.behind_writes.fetch_add(1, Ordering::SeqCst) + 1;
            if bw as u64 > self.behind_writes_used.load(Ordering::SeqCst) {
                self.behind_writes_used.store(bw as u64, Ordering::SeqCst);
            }
            trace!("inc write-behind count {}/{}", bw, self.max_write_behind);
        }

        while sectors > 0 {
            let chunk = offset >> self.counters.chunkshift();
            loop {
                let overflowed = self
                    .counters
                    .peek_counter(offset)
                    .map(|c| c.count() == COUNTER_MAX)
                    .unwrap_or(false);
                if !overflowed {
                    break;
                }
                self.overflow_wait.wait_while(|| {
                    self.counters
                        .peek_counter(offset)
                        .map(|c| c.count() == COUNTER_MAX)
                        .unwrap_or(false)
                });
            }

            let blocks = self
                .counters
                .with_counter_mut(offset, true, |counter, blocks| {
                    if counter.is_zero() {
                        self.storage.set_bit(chunk);
                        self.counters.count_page(offset, 1);
                        counter.set_count(2);
                    } else if counter.count() == 1 {
                        counter.set_count(2);
                    }
                    counter.saturating_incr();
                    blocks
                })
                .unwrap_or_else(|_| self.counters.fallback_blocks());

            offset += blocks;
            sectors = sectors.saturating_sub(blocks);
        }
    }

    /// `bitmap_endwrite` (§4.5): reverses `startwrite`'s bookkeeping,
    /// stamps `events_cleared`/`need_sync` on a fully-clean write, flags
    /// `NEEDED` on failure, and wakes the overflow queue if a counter drops
    /// off `COUNTER_MAX`.
    pub fn endwrite(&self, mut offset: u64, mut sectors: u64, success: bool, behind: bool) {
        if behind && self.behind_writes.fetch_sub(1, Ordering::SeqCst) - 1 == 0 {
            self.behind_wait.wake_all();
        }

        while sectors > 0 {
            let array_events = self.array.events();
            let degraded = self.array.is_degraded();
            let mut wake_overflow = false;
            let mut set_pending = false;

            let blocks = match self.counters.with_counter_mut(offset, false, |counter, blocks| {
                if success && !degraded && self.events_cleared.load(Ordering::SeqCst) < array_events {
                    self.events_cleared.store(array_events, Ordering::SeqCst);
                    self.need_sync.store(true, Ordering::SeqCst);
                }
                if !success && !counter.needed() {
                    counter.set_needed(true);
                }
                if counter.count() == COUNTER_MAX {
                    wake_overflow = true;
                }
                counter.saturating_decr();
                if counter.count() <= 2 {
                    set_pending = true;
                }
                blocks
            }) {
                Ok(blocks) => blocks,
                Err(_) => return,
            };

            if wake_overflow {
                self.overflow_wait.wake_all();
            }
            if set_pending {
                self.counters.set_pending(offset);
                self.allclean.store(false, Ordering::SeqCst);
            }

            offset += blocks;
            sectors = sectors.saturating_sub(blocks);
        }
    }

    fn start_sync_one(&self, offset: u64, degraded: bool) -> (bool, u64) {
        match self.counters.with_counter_mut(offset, false, |counter, blocks| {
            let rv = if counter.resync() {
                true
            } else if counter.needed() {
                if !degraded {
                    counter.set_resync(true);
                    counter.set_needed(false);
                }
                true
            } else {
                false
            };
            (rv, blocks)
        }) {
            Ok((rv, blocks)) => (rv, blocks),
            Err(_) => (true, 1024),
        }
    }

    /// `bitmap_start_sync` (§4.5): reports whether resync should process
    /// the chunk(s) at `offset`, always advancing by whole storage pages so
    /// callers stay PAGE_SIZE-aligned.
    pub fn start_sync(&self, offset: u64, degraded: bool) -> (bool, u64) {
        let mut rv = false;
        let mut total_blocks = 0u64;
        let page_sectors = (PAGE_SIZE as u64) / SECTOR_SIZE;
        let mut cursor = offset;
        while total_blocks < page_sectors {
            let (hit, blocks) = self.start_sync_one(cursor, degraded);
            rv |= hit;
            cursor += blocks;
            total_blocks += blocks;
        }
        (rv, total_blocks)
    }

    /// `bitmap_end_sync`.
    pub fn end_sync(&self, offset: u64, aborted: bool) -> u64 {
        match self.counters.with_counter_mut(offset, false, |counter, blocks| {
            if counter.resync() {
                counter.set_resync(false);
                if !counter.needed() && aborted {
                    counter.set_needed(true);
                } else if counter.count() <= 2 {
                    Some(blocks)
                } else {
                    None
                }
            } else {
                None
            }
        }) {
            Ok(Some(blocks)) => {
                self.counters.set_pending(offset);
                self.allclean.store(false, Ordering::SeqCst);
                blocks
            }
            Ok(None) => self
                .counters
                .peek_counter(offset)
                .map(|_| 1u64 << self.counters.chunkshift())
                .unwrap_or(1024),
            Err(_) => 1024,
        }
    }

    /// `bitmap_close_sync` (§4.5): clears any RESYNC bit left set after a
    /// resync pass finishes, walking the whole resync range.
    pub fn close_sync(&self) {
        let mut sector = 0u64;
        let max = self.resync_max_sectors();
        while sector < max {
            let blocks = self.end_sync(sector, false);
            sector += blocks.max(1);
        }
    }

    /// `bitmap_cond_end_sync` (§4.5): periodically clears RESYNC behind the
    /// current resync cursor, rate-limited by `daemon_sleep` so it doesn't
    /// dominate the resync thread.
    pub fn cond_end_sync(&self, sector: u64) {
        if sector == 0 {
            *self.last_end_sync.lock().unwrap() = self.clock.now();
            return;
        }
        let last = *self.last_end_sync.lock().unwrap();
        if self.clock.now().duration_since(last) < self.daemon_sleep {
            return;
        }
        let aligned = sector & !((1u64 << self.counters.chunkshift()) - 1);
        let mut s = 0u64;
        let max = self.resync_max_sectors();
        while s < aligned && s < max {
            let blocks = self.end_sync(s, false);
            s += blocks.max(1);
        }
        *self.last_end_sync.lock().unwrap() = self.clock.now();
    }

    /// `bitmap_dirty_bits` (§4.5, used by resize): forces chunks `[s, e]`
    /// resident with a set bit and NEEDED counter, e.g. to mark newly
    /// extended space as requiring resync.
    pub fn dirty_bits(&self, s: u64, e: u64) {
        for chunk in s..=e {
            let sector = chunk << self.counters.chunkshift();
            self.set_memory_bits(sector, true);
            self.storage.set_bit(chunk);
        }
    }

    /// `bitmap_set_memory_bits` (§4.5): initializes a fresh counter to `2`
    /// (optionally NEEDED) the first time it's touched.
    pub(crate) fn set_memory_bits(&self, offset: u64, needed: bool) {
        let chunk = offset >> self.counters.chunkshift();
        let result = self.counters.with_counter_mut(offset, true, |counter, _blocks| {
            if counter.is_zero() {
                counter.set_count(2);
                counter.set_needed(needed);
                true
            } else {
                false
            }
        });
        if let Ok(true) = result {
            self.counters.count_page(offset, 1);
            self.counters.set_pending(offset);
            self.allclean.store(false, Ordering::SeqCst);
            let _ = chunk;
        }
    }

    pub fn daemon_idle_for(&self) -> Duration {
        self.clock.now().duration_since(self.daemon_lastrun())
    }
}
