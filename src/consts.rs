//! Shared sizing constants. All of these are powers of two by construction;
//! the shifts exist so hot paths (`get_counter`, `file_page_index`) never
//! divide.

/// Nominal page size backing both counter pages and storage pages.
pub const PAGE_SIZE: usize = 4096;

/// Bits addressable in one storage page.
pub const PAGE_BITS: usize = PAGE_SIZE * 8;
pub const PAGE_BIT_SHIFT: u32 = PAGE_BITS.trailing_zeros();
pub const PAGE_BIT_MASK: usize = PAGE_BITS - 1;

/// Counters packed per counter page (2 bytes per counter).
pub const PAGE_COUNTER_RATIO: usize = PAGE_SIZE / std::mem::size_of::<u16>();
pub const PAGE_COUNTER_SHIFT: u32 = PAGE_COUNTER_RATIO.trailing_zeros();
pub const PAGE_COUNTER_MASK: usize = PAGE_COUNTER_RATIO - 1;
pub const COUNTER_BYTE_SHIFT: u32 = 1; // sizeof(counter) == 2 == 1 << 1

pub const COUNTER_MAX: u16 = 0x3FFE;
pub const NEEDED_MASK: u16 = 0x8000;
pub const RESYNC_MASK: u16 = 0x4000;
pub const COUNTER_VALUE_MASK: u16 = 0x3FFF;

/// Fixed superblock size (§6).
pub const SB_BYTES: usize = 256;

pub const BITMAP_MAGIC: u32 = 0x6d746962; // "bitm", arbitrary but stable

/// Sector size in bytes, used to convert sector counts to byte offsets.
pub const SECTOR_SIZE: u64 = 512;

pub const MAX_SCHED_SECONDS: u32 = 600;
