//! `bitmap_init_from_disk` (§4.8): reconstructs the in-memory counter map
//! from whatever is already on disk, or manufactures a full-resync image
//! when there is nothing to read.
use super::Bitmap;
use crate::deps::log::info;
use crate::error::BitmapError;

/// No persistent storage at all (brand new bitmap, no backing file/device
/// offset): every chunk is marked NEEDED so the first resync covers the
/// whole device.
pub(super) fn init_empty(bitmap: &Bitmap) {
    let chunks = bitmap.counters().chunks();
    let chunkshift = bitmap.counters().chunkshift();
    for chunk in 0..chunks {
        bitmap.set_memory_bits(chunk << chunkshift, true);
    }
}

/// Reads every already-resident storage page (the caller has populated
/// them via `Storage::read_all`) and sets the in-memory counter for each
/// set bit. A chunk's final sector must reach at least `start` for it to
/// be marked NEEDED -- this lets a caller re-read an out-of-date bitmap
/// while ignoring bits that cover sectors already known to be in sync.
pub(super) fn init_from_disk(bitmap: &Bitmap, start: u64) -> Result<(), BitmapError> {
    let outofdate = bitmap.is_stale();
    if outofdate {
        info!("bitmap file is out of date, doing full recovery");
        bitmap.storage().force_all_ones();
        for page in 0..bitmap.storage().file_pages() {
            bitmap.write_page_checked(page, true)?;
        }
    }

    let chunks = bitmap.counters().chunks();
    let chunkshift = bitmap.counters().chunkshift();
    let mut bit_cnt = 0u64;
    for chunk in 0..chunks {
        if bitmap.storage().test_bit(chunk) {
            let needed = ((chunk + 1) << chunkshift) >= start;
            bitmap.set_memory_bits(chunk << chunkshift, needed);
            bit_cnt += 1;
        }
    }
    info!(
        "bitmap initialized from disk: read {} pages, set {} of {} bits",
        bitmap.storage().file_pages(),
        bit_cnt,
        chunks
    );
    Ok(())
}
