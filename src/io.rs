use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{deps::log::debug, error::BitmapError};

/// Open (creating if necessary) the backing file for a file-backed storage
/// image, positioned at `offset` bytes from the start.
pub fn open_raw_file(path: &Path, create: bool, offset: u64) -> Result<File, BitmapError> {
    debug!("opening bitmap file: {:?} (create={})", path, create);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)?;
    if offset != 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    Ok(file)
}

/// Read `buf.len()` bytes from `offset`, treating anything past the file's
/// current end as zero rather than failing -- a freshly created or not yet
/// fully extended bitmap file behaves like a sparse/thin-provisioned device,
/// and `Storage::new` sizes every page to a full `PAGE_SIZE` regardless of
/// how much of that page has actually been written to disk so far.
pub fn pread_exact(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<(), BitmapError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..])? {
            0 => break,
            n => read += n,
        }
    }
    for byte in &mut buf[read..] {
        *byte = 0;
    }
    Ok(())
}

/// Write `buf` at `offset` and flush it to the underlying device, bypassing
/// any page-cache buffering delay -- mirrors the spec's "file I/O bypasses
/// the filesystem cache for subsequent writes" contract.
pub fn pwrite_all(file: &mut File, offset: u64, buf: &[u8]) -> Result<(), BitmapError> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    file.sync_data()?;
    Ok(())
}
