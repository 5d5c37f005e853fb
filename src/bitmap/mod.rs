//! Public API & Attributes (§4.6): the runtime root tying the Page Pool,
//! Counter Map, Storage Layer and Dirty-Page Tracker together, plus the
//! state machine operations, daemon thread, resize and disk-load paths.
pub mod cluster;
pub mod load;
pub mod ops;
pub mod resize;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::consts::PAGE_SIZE;
use crate::countermap::CounterMap;
use crate::deps::log::info;
use crate::error::BitmapError;
use crate::host::{ArrayMeta, ClusterLock, Clock, PageAllocator};
use crate::storage::{Backend, BitOrder, Storage, Superblock};
use crate::wait::WaitQueue;

bitflags::bitflags! {
    /// Runtime-only state, distinct from the on-disk `SbState` (§4.6).
    pub struct BitmapFlags: u32 {
        /// The image is no longer trustworthy; writes are dropped, a full
        /// resync is forced on next load.
        const STALE       = 0b001;
        /// The last page write failed; triggers the kick path.
        const WRITE_ERROR = 0b010;
        /// The image was written in host byte/bit order rather than
        /// little-endian (superblock version `VERSION_HOSTENDIAN`).
        const HOSTENDIAN  = 0b100;
    }
}

/// Configuration the bitmap is created or loaded with (§7 Configuration
/// Surface attributes, minus `location` which the caller resolves into a
/// concrete `Backend` before calling `Bitmap::create`).
pub struct BitmapConfig {
    pub chunksize: u32,
    pub daemon_sleep: Duration,
    pub max_write_behind: usize,
    pub external: bool,
    pub nodes: u32,
    pub sectors_reserved: u32,
}

pub struct Bitmap {
    counters: CounterMap,
    storage: Storage,
    array: Arc<dyn ArrayMeta>,
    clock: Arc<dyn Clock>,
    cluster_lock: Arc<dyn ClusterLock>,

    flags: Mutex<BitmapFlags>,
    need_sync: AtomicBool,
    events_cleared: AtomicU64,
    allclean: AtomicBool,

    daemon_sleep: Duration,
    daemon_lastrun: Mutex<Instant>,
    last_end_sync: Mutex<Instant>,

    behind_writes: AtomicI64,
    behind_writes_used: AtomicU64,
    max_write_behind: usize,

    pending_writes: AtomicI64,
    overflow_wait: WaitQueue,
    write_wait: WaitQueue,
    behind_wait: WaitQueue,

    external: bool,
    resync_max_sectors: AtomicU64,
    cluster_nodes: cluster::ClusterNodes,
}

impl Bitmap {
    /// `bitmap_create` + `bitmap_new_disk_sb` (§4.3, §4.8): builds a brand
    /// new image with an empty counter map sized for `blocks` at
    /// `config.chunksize`, writes a fresh superblock, and arranges for a
    /// full resync (every chunk NEEDED) since there is nothing on disk yet.
    pub fn create(
        backend: Backend,
        blocks: u64,
        config: BitmapConfig,
        array: Arc<dyn ArrayMeta>,
        clock: Arc<dyn Clock>,
        cluster_lock: Arc<dyn ClusterLock>,
        allocator: Arc<dyn PageAllocator>,
    ) -> Result<Self, BitmapError> {
        let chunkshift = chunkshift_for(config.chunksize);
        let chunks = div_round_up_u64(blocks, 1u64 << chunkshift);
        let with_super = !config.external;
        let storage = Storage::new(backend, with_super, chunks, BitOrder::Little, cluster_lock.clone());

        if with_super {
            let sb = Superblock::new(
                array.uuid(),
                config.chunksize,
                config.daemon_sleep.as_secs() as u32,
                config.max_write_behind as u32,
                blocks,
            );
            storage.write_superblock_image(&sb);
        }

        let bitmap = Self {
            counters: CounterMap::new(chunkshift, chunks, allocator),
            storage,
            array,
            clock,
            cluster_lock,
            flags: Mutex::new(BitmapFlags::empty()),
            need_sync: AtomicBool::new(false),
            events_cleared: AtomicU64::new(0),
            allclean: AtomicBool::new(true),
            daemon_sleep: config.daemon_sleep,
            daemon_lastrun: Mutex::new(Instant::now()),
            last_end_sync: Mutex::new(Instant::now()),
            behind_writes: AtomicI64::new(0),
            behind_writes_used: AtomicU64::new(0),
            max_write_behind: config.max_write_behind,
            pending_writes: AtomicI64::new(0),
            overflow_wait: WaitQueue::new(),
            write_wait: WaitQueue::new(),
            behind_wait: WaitQueue::new(),
            external: config.external,
            resync_max_sectors: AtomicU64::new(blocks),
            cluster_nodes: cluster::ClusterNodes::new(config.nodes),
        };

        // No persistent bits read in yet: mark every chunk NEEDED so the
        // first resync covers the whole device, mirroring
        // `bitmap_init_from_disk`'s "no permanent bitmap" branch.
        load::init_empty(&bitmap);
        bitmap.storage.mark_all_dirty();
        Ok(bitmap)
    }

    /// `bitmap_read_sb` + `bitmap_init_from_disk` (§4.3, §4.8): opens an
    /// existing image, validates its superblock, and reconstructs in-memory
    /// counters from the on-disk bit array.
    pub fn load(
        backend: Backend,
        config_hint_chunksize: u32,
        array: Arc<dyn ArrayMeta>,
        clock: Arc<dyn Clock>,
        cluster_lock: Arc<dyn ClusterLock>,
        allocator: Arc<dyn PageAllocator>,
        start: u64,
    ) -> Result<Self, BitmapError> {
        // Need at least one page resident to read the superblock at all;
        // size the storage generously, then re-derive from the real
        // chunksize once it's known.
        let probe_chunks = 1u64 << PAGE_SIZE.trailing_zeros();
        let mut storage = Storage::new(
            backend,
            true,
            probe_chunks,
            BitOrder::Little,
            cluster_lock.clone(),
        );
        storage.read_page(0, array.as_ref())?;
        let sb = storage
            .read_superblock()
            .ok_or_else(|| BitmapError::InvalidImage {
                reason: "no superblock page".into(),
            })?;
        sb.validate(Some(array.uuid()))?;
        let _ = config_hint_chunksize;

        let chunkshift = chunkshift_for(sb.chunksize);
        let chunks = div_round_up_u64(sb.sync_size, 1u64 << chunkshift);

        // Re-derive storage with the real chunk count now that the
        // superblock has told us the true layout, then re-read every page
        // (the probe above only populated page 0).
        storage.resize_for_chunks(chunks);
        storage.read_all(array.as_ref())?;

        let daemon_sleep = Duration::from_secs(sb.daemon_sleep_secs as u64);
        let mut flags = BitmapFlags::empty();
        if sb.is_hostendian() {
            flags.insert(BitmapFlags::HOSTENDIAN);
        }
        // Carry the on-disk STALE/WRITE_ERROR marks into runtime state: a
        // reload of a kicked image must force a full resync (§7, §8
        // Scenario C/E), which only happens if `is_stale()` reports true
        // from the moment `init_from_disk` runs.
        if sb.state.contains(crate::storage::superblock::SbState::STALE) {
            flags.insert(BitmapFlags::STALE);
        }
        if sb.state.contains(crate::storage::superblock::SbState::WRITE_ERROR) {
            flags.insert(BitmapFlags::WRITE_ERROR);
        }
        let bitmap = Self {
            counters: CounterMap::new(chunkshift, chunks, allocator),
            storage,
            array,
            clock,
            cluster_lock,
            flags: Mutex::new(flags),
            need_sync: AtomicBool::new(false),
            events_cleared: AtomicU64::new(sb.events_cleared),
            allclean: AtomicBool::new(true),
            daemon_sleep,
            daemon_lastrun: Mutex::new(Instant::now()),
            last_end_sync: Mutex::new(Instant::now()),
            behind_writes: AtomicI64::new(0),
            behind_writes_used: AtomicU64::new(0),
            max_write_behind: sb.write_behind as usize,
            pending_writes: AtomicI64::new(0),
            overflow_wait: WaitQueue::new(),
            write_wait: WaitQueue::new(),
            behind_wait: WaitQueue::new(),
            external: false,
            resync_max_sectors: AtomicU64::new(sb.sync_size),
            cluster_nodes: cluster::ClusterNodes::new(sb.nodes),
        };

        load::init_from_disk(&bitmap, start)?;
        info!("bitmap initialized from disk: {} pages", bitmap.storage.file_pages());
        Ok(bitmap)
    }

    pub fn counters(&self) -> &CounterMap {
        &self.counters
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn array(&self) -> &dyn ArrayMeta {
        self.array.as_ref()
    }

    /// Per-node availability/reclaim bookkeeping (§3.1). Inert when the
    /// array is single-node.
    pub fn cluster_nodes(&self) -> &cluster::ClusterNodes {
        &self.cluster_nodes
    }

    /// Whether the image has been kicked (§7: a write error marked the
    /// image `STALE`). Once true, bit updates are dropped in memory and a
    /// future `load` forces a full resync.
    pub fn is_stale(&self) -> bool {
        self.flags.lock().unwrap().contains(BitmapFlags::STALE)
    }

    fn set_stale(&self) -> bool {
        let mut flags = self.flags.lock().unwrap();
        let was_stale = flags.contains(BitmapFlags::STALE);
        flags.insert(BitmapFlags::STALE);
        was_stale
    }

    /// Whether the most recent page write failed (§7). Set alongside
    /// `is_stale` by the kick path; exposed separately so a caller can tell
    /// "currently erroring" apart from "already kicked" during the single
    /// tick where both become true together.
    pub fn has_write_error(&self) -> bool {
        self.flags.lock().unwrap().contains(BitmapFlags::WRITE_ERROR)
    }

    fn set_write_error(&self) {
        self.flags.lock().unwrap().insert(BitmapFlags::WRITE_ERROR);
    }

    pub fn resync_max_sectors(&self) -> u64 {
        self.resync_max_sectors.load(Ordering::SeqCst)
    }

    pub fn behind_writes(&self) -> i64 {
        self.behind_writes.load(Ordering::SeqCst)
    }

    pub fn behind_writes_used(&self) -> u64 {
        self.behind_writes_used.load(Ordering::SeqCst)
    }

    /// `bitmap_update_sb` (§4.3): rewrites the superblock from current
    /// runtime state. Called by the daemon (events_cleared stamping) and by
    /// the kick path (STALE/WRITE_ERROR stamping).
    pub fn update_sb(&self) -> Result<(), BitmapError> {
        if !self.storage.has_superblock() {
            return Ok(());
        }
        let mut sb = self
            .storage
            .read_superblock()
            .ok_or_else(|| BitmapError::InvalidImage {
                reason: "no superblock page".into(),
            })?;
        sb.events = self.array.events();
        if sb.events < self.events_cleared.load(Ordering::SeqCst) {
            self.events_cleared.store(sb.events, Ordering::SeqCst);
        }
        sb.events_cleared = self.events_cleared.load(Ordering::SeqCst);
        let mut state = crate::storage::superblock::SbState::empty();
        if self.is_stale() {
            state.insert(crate::storage::superblock::SbState::STALE);
        }
        if self.has_write_error() {
            state.insert(crate::storage::superblock::SbState::WRITE_ERROR);
        }
        sb.state = state;
        self.storage.write_superblock_image(&sb);
        // Bypass `write_page_checked`: its own `is_stale` guard exists to
        // stop *routine* page writes once the image is kicked, but this
        // call is how the STALE mark itself reaches disk -- `kick` always
        // calls here after `is_stale()` has already flipped true, so
        // routing through `write_page_checked` would silently drop the one
        // write that matters (§6, §8 Scenario E).
        self.storage.write_page(0, true, self.array.as_ref())
    }

    /// `write_page(bitmap, page, wait)` wrapper: on I/O failure, sets
    /// `WRITE_ERROR` and kicks the image (§4.3, §6 error taxonomy).
    fn write_page_checked(&self, page: usize, wait: bool) -> Result<(), BitmapError> {
        if self.is_stale() {
            return Ok(());
        }
        match self.storage.write_page(page, wait, self.array.as_ref()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_write_error();
                self.kick();
                Err(e)
            }
        }
    }

    /// `bitmap_file_kick` (§4.3, §6): once STALE is set the image is
    /// considered unreliable and every subsequent bit update is dropped in
    /// memory only; the superblock is rewritten one last time to record the
    /// failure so a later `load` sees it and forces a full resync.
    fn kick(&self) {
        if !self.set_stale() {
            let _ = self.update_sb();
            info!("bitmap image kicked from array after write error");
        }
    }

    /// `bitmap_unplug` (§4.3, §5): flush every DIRTY/NEEDWRITE page, then
    /// block until those writes have landed, then kick if any of them
    /// failed.
    pub fn unplug(&self) -> Result<(), BitmapError> {
        if self.is_stale() {
            return Ok(());
        }
        let mut waited = false;
        for page in 0..self.storage.file_pages() {
            let dirty = self.storage.attr.test_and_clear(page, crate::storage::PageAttr::DIRTY);
            let need_write = self
                .storage
                .attr
                .test_and_clear(page, crate::storage::PageAttr::NEEDWRITE);
            if dirty || need_write {
                self.storage.attr.clear(page, crate::storage::PageAttr::PENDING);
                self.pending_writes.fetch_add(1, Ordering::SeqCst);
                let result = self.write_page_checked(page, false);
                self.pending_writes.fetch_sub(1, Ordering::SeqCst);
                self.write_wait.wake_all();
                result?;
            }
            if dirty {
                waited = true;
            }
        }
        if waited {
            self.write_wait.wait_while(|| self.pending_writes.load(Ordering::SeqCst) != 0);
        }
        if self.has_write_error() {
            self.kick();
        }
        Ok(())
    }

    /// `bitmap_write_all` (§4.3): flags every page NEEDWRITE without
    /// actually writing -- used after a resize or other bulk change so the
    /// next `unplug`/daemon tick does the real I/O.
    pub fn write_all(&self) {
        for page in 0..self.storage.file_pages() {
            self.storage.attr.set(page, crate::storage::PageAttr::NEEDWRITE);
        }
        self.allclean.store(false, Ordering::SeqCst);
    }

    pub fn daemon_sleep(&self) -> Duration {
        self.daemon_sleep
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// `bitmap_destroy`: flush and drop the in-memory image. Any subsequent
    /// call into this bitmap after `destroy` panics -- callers must not
    /// retain a reference, matching the teacher's RAII-on-drop discipline.
    pub fn destroy(self) -> Result<(), BitmapError> {
        self.unplug()
    }

    /// `bitmap_daemon_work` (§4.5): one periodic sweep. Driven by
    /// `crate::daemon::Daemon`'s thread, but the algorithm itself lives here
    /// since it needs the runtime state this type owns privately.
    /// `bitmap_daemon_work` (§4.5) exposed directly: normally driven by
    /// `crate::daemon::Daemon`'s background thread on `daemon_sleep`, but
    /// also callable directly by a caller that wants a synchronous sweep
    /// (e.g. an integration test asserting the two-tick decay law, or an
    /// operator forcing a flush before shutdown without waiting out the
    /// timer).
    pub fn daemon_tick(&self) {
        self.storage.attr.promote_pending_to_needwrite();

        if self.need_sync.load(Ordering::SeqCst) && !self.external {
            self.need_sync.store(false, Ordering::SeqCst);
            if let Some(mut sb) = self.storage.read_superblock() {
                sb.events_cleared = self.events_cleared.load(Ordering::SeqCst);
                self.storage.write_superblock_image(&sb);
                self.storage.attr.set(0, crate::storage::PageAttr::NEEDWRITE);
            }
        }

        let mut allclean = true;
        let ratio = crate::consts::PAGE_COUNTER_RATIO as u64;
        let mut chunk = 0u64;
        while chunk < self.counters.chunks() {
            let page = (chunk >> crate::consts::PAGE_COUNTER_SHIFT) as usize;
            if chunk % ratio == 0 && !self.counters.take_page_pending(page) {
                chunk += ratio;
                continue;
            }
            let offset = chunk << self.counters.chunkshift();
            let decayed = self.counters.with_counter_mut(offset, false, |counter, _blocks| {
                // Compare the raw 16-bit value, not just the masked count:
                // a NEEDED/RESYNC chunk's raw value is >= 0x4000, well above
                // 2, so it must never decay here -- only a chunk with
                // neither flag set and a small in-flight count does.
                let raw = counter.raw();
                if raw == 1 && !self.need_sync.load(Ordering::SeqCst) {
                    counter.set_count(0);
                    Some(false)
                } else if raw != 0 && raw <= 2 {
                    counter.set_count(1);
                    Some(true)
                } else {
                    None
                }
            });
            match decayed {
                Ok(Some(true)) => {
                    self.counters.set_pending(offset);
                    allclean = false;
                }
                Ok(Some(false)) => {
                    self.counters.count_page(offset, -1);
                    if self.storage.clear_bit(chunk) {
                        // The bit's owning page just went PENDING and won't
                        // be promoted to NEEDWRITE until next tick's step 1
                        // -- keep the daemon from parking on the idle
                        // timeout until that write actually lands.
                        allclean = false;
                    }
                }
                Ok(None) | Err(_) => {}
            }
            chunk += 1;
        }

        for page in 0..self.storage.file_pages() {
            if self.is_stale() {
                break;
            }
            if self.storage.attr.test(page, crate::storage::PageAttr::DIRTY) {
                break;
            }
            if self.storage.attr.test_and_clear(page, crate::storage::PageAttr::NEEDWRITE) {
                if self.write_page_checked(page, false).is_err() {
                    allclean = false;
                }
            }
        }

        self.allclean.store(allclean, Ordering::SeqCst);
        *self.daemon_lastrun.lock().unwrap() = self.clock.now();
    }

    /// Whether every storage page is currently clean (no DIRTY/NEEDWRITE
    /// page and no pending counter decay) -- what the daemon checks before
    /// parking itself on the long idle timeout.
    pub fn is_allclean(&self) -> bool {
        self.allclean.load(Ordering::SeqCst)
    }

    pub(crate) fn daemon_lastrun(&self) -> Instant {
        *self.daemon_lastrun.lock().unwrap()
    }
}

fn chunkshift_for(chunksize: u32) -> u32 {
    let blocksize = crate::consts::SECTOR_SIZE as u32;
    (chunksize / blocksize).max(1).trailing_zeros()
}

fn div_round_up_u64(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}
