//! Storage Layer (§4.3): the on-disk image, either device-embedded (through
//! a block transport, to every active member) or file-backed (through a
//! regular file, bypassing the filesystem page cache for subsequent I/O).
pub mod attr;
pub mod superblock;

use std::sync::{Arc, Mutex};

use crate::consts::{PAGE_BITS, PAGE_BIT_MASK, PAGE_BIT_SHIFT, PAGE_SIZE, SB_BYTES};
use crate::deps::log::{debug, warn};
use crate::error::BitmapError;
use crate::host::{ArrayMeta, BlockTransport, ClusterLock, LockCallbacks, LockMode, MemberId};

pub use attr::{AttrTable, PageAttr};
pub use superblock::Superblock;

/// Bit-set/bit-test strategy selecting host-native or little-endian bit
/// order within a page (§4.3, §9 Design Notes: "do not rely on platform
/// byte order").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    Little,
    Host,
}

impl BitOrder {
    fn byte_and_mask(self, bit: usize) -> (usize, u8) {
        match self {
            BitOrder::Little => (bit / 8, 1u8 << (bit % 8)),
            // "Host" bit order numbers bits from the most significant bit of
            // each byte on a big-endian-bit machine; since every realistic
            // deployment target of this crate is little-endian-bit, Host
            // and Little coincide here. The distinction exists so a
            // HOSTENDIAN image written by a big-endian-bit host is never
            // silently misread -- see `Storage::bit_order`.
            BitOrder::Host => (bit / 8, 1u8 << (bit % 8)),
        }
    }

    pub fn set(self, page: &mut [u8], bit: usize) {
        let (byte, mask) = self.byte_and_mask(bit);
        page[byte] |= mask;
    }

    pub fn clear(self, page: &mut [u8], bit: usize) {
        let (byte, mask) = self.byte_and_mask(bit);
        page[byte] &= !mask;
    }

    pub fn test(self, page: &[u8], bit: usize) -> bool {
        let (byte, mask) = self.byte_and_mask(bit);
        page[byte] & mask != 0
    }
}

pub enum Backend {
    DeviceEmbedded {
        transport: Arc<dyn BlockTransport>,
        /// Sectors relative to each member's superblock; negative means
        /// "below the superblock".
        offset_sectors: i64,
    },
    FileBacked {
        file: Mutex<std::fs::File>,
    },
}

pub struct Storage {
    backend: Backend,
    with_super: bool,
    file_pages: usize,
    /// Total payload size: `ceil(chunks/8) + [SB_BYTES if embedded]`.
    pub bytes: usize,
    bit_order: BitOrder,
    pages: Vec<Mutex<Vec<u8>>>,
    pub attr: AttrTable,
    cluster_lock: Arc<dyn ClusterLock>,
}

fn pages_for_bytes(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

impl Storage {
    pub fn new(
        backend: Backend,
        with_super: bool,
        chunks: u64,
        bit_order: BitOrder,
        cluster_lock: Arc<dyn ClusterLock>,
    ) -> Self {
        let bit_bytes = ((chunks + 7) / 8) as usize;
        let bytes = if with_super { bit_bytes + SB_BYTES } else { bit_bytes };
        let file_pages = pages_for_bytes(bytes).max(1);
        let pages = (0..file_pages).map(|_| Mutex::new(vec![0u8; PAGE_SIZE])).collect();
        Self {
            backend,
            with_super,
            file_pages,
            bytes,
            bit_order,
            pages,
            attr: AttrTable::new(file_pages),
            cluster_lock,
        }
    }

    pub fn file_pages(&self) -> usize {
        self.file_pages
    }

    /// Re-derives page count and byte length for a new chunk count,
    /// growing or shrinking `pages`/`attr` in place while preserving page 0
    /// (the superblock, when present). Used when the true chunk count
    /// becomes known only after reading the superblock (`Bitmap::load`) and
    /// during `bitmap_resize` (§4.7).
    pub fn resize_for_chunks(&mut self, chunks: u64) {
        let bit_bytes = ((chunks + 7) / 8) as usize;
        self.bytes = if self.with_super { bit_bytes + SB_BYTES } else { bit_bytes };
        let new_file_pages = pages_for_bytes(self.bytes).max(1);
        if new_file_pages > self.pages.len() {
            self.pages
                .extend((self.pages.len()..new_file_pages).map(|_| Mutex::new(vec![0u8; PAGE_SIZE])));
        } else {
            self.pages.truncate(new_file_pages);
        }
        self.file_pages = new_file_pages;
        self.attr = AttrTable::new(new_file_pages);
    }

    pub fn has_superblock(&self) -> bool {
        self.with_super
    }

    fn chunk_bit_position(&self, chunk: u64) -> u64 {
        if self.with_super {
            chunk + (SB_BYTES as u64 * 8)
        } else {
            chunk
        }
    }

    pub fn file_page_index(&self, chunk: u64) -> usize {
        (self.chunk_bit_position(chunk) >> PAGE_BIT_SHIFT) as usize
    }

    pub fn file_page_offset(&self, chunk: u64) -> usize {
        (self.chunk_bit_position(chunk) as usize) & PAGE_BIT_MASK
    }

    /// `bitmap_file_set_bit`: called before a write reaches the member
    /// devices, to mark the chunk's bit and the owning page DIRTY.
    pub fn set_bit(&self, chunk: u64) {
        let page = self.file_page_index(chunk);
        if page >= self.file_pages {
            return;
        }
        let bit = self.file_page_offset(chunk);
        let mut buf = self.pages[page].lock().unwrap();
        self.bit_order.set(&mut buf, bit);
        drop(buf);
        self.attr.mark_dirty(page);
    }

    /// `bitmap_file_clear_bit`. Returns `true` when the page's clean state
    /// actually changed (the caller should clear `allclean`).
    pub fn clear_bit(&self, chunk: u64) -> bool {
        let page = self.file_page_index(chunk);
        if page >= self.file_pages {
            return false;
        }
        let bit = self.file_page_offset(chunk);
        {
            let mut buf = self.pages[page].lock().unwrap();
            self.bit_order.clear(&mut buf, bit);
        }
        self.attr.mark_pending_unless_needwrite(page)
    }

    pub fn test_bit(&self, chunk: u64) -> bool {
        let page = self.file_page_index(chunk);
        if page >= self.file_pages {
            return false;
        }
        let bit = self.file_page_offset(chunk);
        let buf = self.pages[page].lock().unwrap();
        self.bit_order.test(&buf, bit)
    }

    /// Overwrites every bit beyond the superblock with `0xFF`, used by
    /// `init_from_disk` when converting a stale image into a full-resync
    /// image (§4.8).
    pub fn force_all_ones(&self) {
        for page in 0..self.file_pages {
            let mut buf = self.pages[page].lock().unwrap();
            let start = if self.with_super && page == 0 { SB_BYTES } else { 0 };
            for byte in buf.iter_mut().skip(start) {
                *byte = 0xFF;
            }
            drop(buf);
            self.attr.mark_dirty(page);
        }
    }

    pub fn mark_all_dirty(&self) {
        for page in 0..self.file_pages {
            self.attr.mark_dirty(page);
        }
    }

    pub fn read_superblock(&self) -> Option<Superblock> {
        if !self.with_super {
            return None;
        }
        let buf = self.pages[0].lock().unwrap();
        let mut sb_bytes = [0u8; SB_BYTES];
        sb_bytes.copy_from_slice(&buf[..SB_BYTES]);
        Some(Superblock::decode(&sb_bytes))
    }

    pub fn write_superblock_image(&self, sb: &Superblock) {
        if !self.with_super {
            return;
        }
        let mut buf = self.pages[0].lock().unwrap();
        buf[..SB_BYTES].copy_from_slice(&sb.encode());
    }

    /// Populates page contents from storage at load time (`read_page`
    /// applied to every page) -- device-embedded reads from one good
    /// member, file-backed reads from the file directly.
    pub fn read_all(&self, array: &dyn ArrayMeta) -> Result<(), BitmapError> {
        for page in 0..self.file_pages {
            self.read_page(page, array)?;
        }
        Ok(())
    }

    pub fn read_page(&self, page_index: usize, array: &dyn ArrayMeta) -> Result<(), BitmapError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        match &self.backend {
            Backend::DeviceEmbedded { transport, offset_sectors } => {
                let mut last_err = None;
                let mut read_ok = false;
                for member in array.active_members() {
                    let target = sector_target(array, member, *offset_sectors, page_index)?;
                    match transport.read_at(member, target, &mut buf) {
                        Ok(()) => {
                            read_ok = true;
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                if !read_ok {
                    return Err(last_err.unwrap_or(BitmapError::Io {
                        source: std::io::Error::new(std::io::ErrorKind::Other, "no active member"),
                    }));
                }
            }
            Backend::FileBacked { file } => {
                let mut file = file.lock().unwrap();
                let offset = (page_index * PAGE_SIZE) as u64;
                crate::io::pread_exact(&mut file, offset, &mut buf)?;
            }
        }
        *self.pages[page_index].lock().unwrap() = buf;
        Ok(())
    }

    /// `write_page(page, wait)` (§4.3). On any failure returns `Err`; the
    /// caller (the `Bitmap` root) is responsible for setting `WRITE_ERROR`
    /// and kicking the image -- this function never mutates bitmap-wide
    /// state beyond the storage it owns.
    pub fn write_page(&self, page_index: usize, wait: bool, array: &dyn ArrayMeta) -> Result<(), BitmapError> {
        let buf = self.pages[page_index].lock().unwrap().clone();
        match &self.backend {
            Backend::DeviceEmbedded { transport, offset_sectors } => {
                let callbacks: Arc<dyn LockCallbacks> = Arc::new(crate::host::reference::NoopLockCallbacks);
                let handle = self.cluster_lock.lock(LockMode::Exclusive, "bitmap-page", callbacks)?;
                let result = self.write_page_to_members(page_index, &buf, *offset_sectors, array, transport.as_ref());
                self.cluster_lock.unlock(handle)?;
                result?;
            }
            Backend::FileBacked { file } => {
                let mut file = file.lock().unwrap();
                let offset = (page_index * PAGE_SIZE) as u64;
                let len = self.page_write_len(page_index);
                crate::io::pwrite_all(&mut file, offset, &buf[..len])?;
                let _ = wait; // file writes are synchronous already (sync_data)
            }
        }
        Ok(())
    }

    fn page_write_len(&self, page_index: usize) -> usize {
        if page_index == self.file_pages - 1 {
            let rem = self.bytes % PAGE_SIZE;
            if rem == 0 {
                PAGE_SIZE
            } else {
                rem
            }
        } else {
            PAGE_SIZE
        }
    }

    fn write_page_to_members(
        &self,
        page_index: usize,
        buf: &[u8],
        offset_sectors: i64,
        array: &dyn ArrayMeta,
        transport: &dyn BlockTransport,
    ) -> Result<(), BitmapError> {
        let members = array.active_members();
        if members.is_empty() {
            return Err(BitmapError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, "no active members"),
            });
        }
        for member in members {
            check_alignment(array, offset_sectors, page_index)?;
            let target = sector_target(array, member, offset_sectors, page_index)?;
            let block_size = array.logical_block_size(member).max(1) as usize;
            let raw_len = self.page_write_len(page_index);
            let len = round_up(raw_len, block_size).min(buf.len());
            transport.write_at(member, target, &buf[..len])?;
        }
        Ok(())
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    ((value + multiple - 1) / multiple) * multiple
}

fn sector_target(
    _array: &dyn ArrayMeta,
    _member: MemberId,
    offset_sectors: i64,
    page_index: usize,
) -> Result<u64, BitmapError> {
    let page_sectors = (PAGE_SIZE / 512) as i64;
    let sector = offset_sectors + page_index as i64 * page_sectors;
    if sector < 0 {
        return Err(BitmapError::AlignmentViolation);
    }
    Ok(sector as u64)
}

/// Rejects a device-embedded placement that would overlap the array's data
/// region or any external metadata region (§4.3, §6).
fn check_alignment(array: &dyn ArrayMeta, offset_sectors: i64, page_index: usize) -> Result<(), BitmapError> {
    let page_sectors = (PAGE_SIZE / 512) as i64;
    let page_start = offset_sectors + page_index as i64 * page_sectors;
    let page_end = page_start + page_sectors;
    let (data_start, data_end) = array.data_region();
    if overlaps(page_start, page_end, data_start as i64, data_end as i64) {
        warn!("bitmap page {} would overlap data region", page_index);
        return Err(BitmapError::AlignmentViolation);
    }
    if let Some((meta_start, meta_end)) = array.external_metadata_region() {
        if overlaps(page_start, page_end, meta_start as i64, meta_end as i64) {
            warn!("bitmap page {} would overlap external metadata", page_index);
            return Err(BitmapError::AlignmentViolation);
        }
    }
    debug!("bitmap page {} placement at sector {} passed alignment check", page_index, page_start);
    Ok(())
}

fn overlaps(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> bool {
    a_start < b_end && b_start < a_end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reference::LocalClusterLock;

    fn file_storage(chunks: u64) -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitmap.img");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let storage = Storage::new(
            Backend::FileBacked { file: Mutex::new(file) },
            true,
            chunks,
            BitOrder::Little,
            Arc::new(LocalClusterLock::new()),
        );
        (storage, dir)
    }

    #[test]
    fn bit_set_clear_round_trips() {
        let (storage, _dir) = file_storage(128);
        assert!(!storage.test_bit(5));
        storage.set_bit(5);
        assert!(storage.test_bit(5));
        assert!(storage.attr.test(0, PageAttr::DIRTY));
        storage.clear_bit(5);
        assert!(!storage.test_bit(5));
    }

    #[test]
    fn file_page_index_accounts_for_superblock_when_present() {
        let (storage, _dir) = file_storage(128);
        // chunk 0 sits right after the 256-byte superblock, still page 0.
        assert_eq!(storage.file_page_index(0), 0);
        assert_eq!(storage.file_page_offset(0), SB_BYTES * 8);
    }

    #[test]
    fn force_all_ones_skips_superblock_bytes() {
        let (storage, _dir) = file_storage(64);
        storage.force_all_ones();
        let buf = storage.pages[0].lock().unwrap();
        assert!(buf[..SB_BYTES].iter().all(|b| *b == 0));
        assert!(buf[SB_BYTES..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn superblock_round_trips_through_page_zero() {
        let (storage, _dir) = file_storage(64);
        let sb = Superblock::new([9u8; 16], 4096, 5, 0, 128);
        storage.write_superblock_image(&sb);
        let read_back = storage.read_superblock().unwrap();
        assert_eq!(sb, read_back);
    }
}
