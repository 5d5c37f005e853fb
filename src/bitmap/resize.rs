//! `bitmap_resize` (§4.7): grow or shrink the counter map and storage to
//! match a new device size, carrying `NEEDED` counters forward and forcing
//! resync on any newly added space.
use std::sync::Arc;

use super::Bitmap;
use crate::consts::SECTOR_SIZE;
use crate::countermap::CounterMap;
use crate::error::BitmapError;
use crate::host::PageAllocator;

impl Bitmap {
    /// Resizes this bitmap to cover `blocks` sectors. `chunksize_hint == 0`
    /// means "pick the smallest chunk size, doubling from the current one,
    /// that still fits the configured reserved space" (§4.7); a nonzero
    /// hint is used as-is.
    pub fn resize(&mut self, blocks: u64, chunksize_hint: u32, init: bool, allocator: Arc<dyn PageAllocator>) -> Result<(), BitmapError> {
        let chunkshift = if chunksize_hint == 0 {
            self.grow_chunkshift(blocks)
        } else {
            super::chunkshift_for(chunksize_hint)
        };
        let new_chunks = div_round_up(blocks, 1u64 << chunkshift);

        if !init {
            self.array.quiesce();
        }

        self.storage.resize_for_chunks(new_chunks);

        let old_counters = std::mem::replace(
            &mut self.counters,
            CounterMap::new(chunkshift, new_chunks, allocator),
        );

        let old_chunkshift = old_counters.chunkshift();
        let old_chunks = old_counters.chunks();
        let limit = std::cmp::min(old_chunks << old_chunkshift, new_chunks << chunkshift);

        let mut block = 0u64;
        while block < limit {
            let old_needed = old_counters.peek_counter(block).map(|c| c.needed()).unwrap_or(false);
            let old_blocks = 1u64 << old_chunkshift.max(1);
            if old_needed {
                let freshly_set = self.counters.with_counter_mut(block, true, |counter, blocks| {
                    let fresh = counter.is_zero();
                    if fresh {
                        let chunk_size = 1u64 << chunkshift;
                        let end = block + blocks;
                        let mut start = (block >> chunkshift) << chunkshift;
                        while start < end {
                            let chunk = start >> chunkshift;
                            self.storage.set_bit(chunk);
                            start += chunk_size;
                        }
                        counter.set_count(2);
                    }
                    counter.set_needed(true);
                    fresh
                });
                if let Ok(true) = freshly_set {
                    self.counters.count_page(block, 1);
                    self.counters.set_pending(block);
                }
            }
            block += old_blocks;
        }

        if !init {
            let total = new_chunks << chunkshift;
            while block < total {
                let result = self.counters.with_counter_mut(block, true, |counter, blocks| {
                    if counter.is_zero() {
                        counter.set_count(2);
                        counter.set_needed(true);
                        Some(blocks)
                    } else {
                        None
                    }
                });
                match result {
                    Ok(Some(blocks)) => {
                        self.counters.count_page(block, 1);
                        self.counters.set_pending(block);
                        block += blocks;
                    }
                    Ok(None) => block += 1u64 << chunkshift,
                    Err(_) => block += 1u64 << chunkshift,
                }
            }
            self.storage.mark_all_dirty();
        }

        if !init {
            self.unplug()?;
            self.array.resume();
        }
        Ok(())
    }

    fn grow_chunkshift(&self, blocks: u64) -> u32 {
        let mut chunkshift = self.counters.chunkshift();
        if chunkshift == 0 {
            chunkshift = 1;
        } else {
            chunkshift -= 1;
        }
        loop {
            chunkshift += 1;
            let chunks = div_round_up(blocks, 1u64 << chunkshift);
            let bytes = div_round_up(chunks, 8) + if self.external { 0 } else { crate::consts::SB_BYTES as u64 };
            let reserved_bytes = (self.resync_max_sectors().max(1)) * SECTOR_SIZE;
            if bytes <= reserved_bytes || chunkshift >= 40 {
                break;
            }
        }
        chunkshift
    }
}

fn div_round_up(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}
