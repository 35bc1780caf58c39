//! The sheaf: a raw page cache over a file handle with dirty-region tracking.
//!
//! Every other component addresses the backing file exclusively through a
//! [`Sheaf`]. It owns the single `File` handle, caches page buffers keyed by
//! their position, and exposes page-granular read/write/force primitives.
//! Per-page monitors (one `Mutex` per cached page) give the per-page-monitor
//! locking level required by the concurrency model; the sheaf itself never
//! reasons about what a page's bytes mean.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::checksum::{Checksum, Crc32Checksum};
use crate::common::{PackError, Position, Result};

struct PageSlot {
    bytes: Box<[u8]>,
    dirty: bool,
}

/// Raw page cache over a single backing file.
pub struct Sheaf {
    file: Mutex<File>,
    path: PathBuf,
    page_size: u32,
    pages: RwLock<HashMap<Position, Arc<Mutex<PageSlot>>>>,
    checksum: Box<dyn Checksum>,
}

impl Sheaf {
    /// Open (creating if necessary) the backing file for `path`.
    pub fn open<P: AsRef<Path>>(path: P, page_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(PackError::Io)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            page_size,
            pages: RwLock::new(HashMap::new()),
            checksum: Box::new(Crc32Checksum),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn checksum(&self, bytes: &[u8]) -> u64 {
        self.checksum.digest(bytes)
    }

    /// Current length of the backing file, in bytes.
    pub fn len(&self) -> Result<u64> {
        self.file
            .lock()
            .metadata()
            .map(|m| m.len())
            .map_err(|source| PackError::IoSize { source })
    }

    /// Grow the file so that it contains at least `position + page_size`
    /// bytes, zero-filling the new region.
    pub fn ensure_len(&self, position: Position) -> Result<()> {
        let needed = position + self.page_size as u64;
        let mut file = self.file.lock();
        let current = file
            .metadata()
            .map(|m| m.len())
            .map_err(|source| PackError::IoSize { source })?;
        if needed > current {
            file.set_len(needed)
                .map_err(|source| PackError::IoTruncate { size: needed, source })?;
        }
        Ok(())
    }

    fn slot_for(&self, position: Position) -> Result<Arc<Mutex<PageSlot>>> {
        if let Some(slot) = self.pages.read().get(&position) {
            return Ok(slot.clone());
        }
        let mut pages = self.pages.write();
        if let Some(slot) = pages.get(&position) {
            return Ok(slot.clone());
        }
        let bytes = self.read_from_disk(position)?;
        let slot = Arc::new(Mutex::new(PageSlot {
            bytes,
            dirty: false,
        }));
        pages.insert(position, slot.clone());
        Ok(slot)
    }

    fn read_from_disk(&self, position: Position) -> Result<Box<[u8]>> {
        let mut buf = vec![0u8; self.page_size as usize];
        let mut file = self.file.lock();
        let len = file
            .metadata()
            .map(|m| m.len())
            .map_err(|source| PackError::IoSize { source })?;
        if position < len {
            file.seek(SeekFrom::Start(position))
                .map_err(|source| PackError::IoRead { position, source })?;
            file.read_exact(&mut buf).or_else(|_| {
                // Short read at end-of-file: leave the tail zero-filled.
                Ok::<(), std::io::Error>(())
            })
            .map_err(|source| PackError::IoRead { position, source })?;
        }
        Ok(buf.into_boxed_slice())
    }

    /// Return a copy of the page's current bytes.
    pub fn read_page(&self, position: Position) -> Result<Box<[u8]>> {
        let slot = self.slot_for(position)?;
        let guard = slot.lock();
        Ok(guard.bytes.clone())
    }

    /// Run `f` with mutable access to the page's in-memory buffer, marking
    /// it dirty. Holds the page's monitor for the duration of `f`.
    pub fn with_page_mut<F, R>(&self, position: Position, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.ensure_len(position)?;
        let slot = self.slot_for(position)?;
        let mut guard = slot.lock();
        let result = f(&mut guard.bytes);
        guard.dirty = true;
        Ok(result)
    }

    /// Run `f` with read-only access to the page's in-memory buffer, under
    /// the page's monitor.
    pub fn with_page<F, R>(&self, position: Position, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let slot = self.slot_for(position)?;
        let guard = slot.lock();
        Ok(f(&guard.bytes))
    }

    /// Reinitialize a page to all zero bytes, without touching the backing
    /// file until the next flush.
    pub fn zero_page(&self, position: Position) -> Result<()> {
        self.with_page_mut(position, |bytes| bytes.fill(0))
    }

    /// Evict a page's in-memory buffer, discarding any unwritten dirty data.
    /// Used after a page is relocated (`MOVE_PAGE`) so the old position's
    /// cached identity cannot be read stale.
    pub fn evict(&self, position: Position) {
        self.pages.write().remove(&position);
    }

    /// Write every dirty page back to the file. Does not force durability.
    pub fn flush_dirty(&self) -> Result<()> {
        let snapshot: Vec<(Position, Arc<Mutex<PageSlot>>)> = self
            .pages
            .read()
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect();
        let mut file = self.file.lock();
        for (position, slot) in snapshot {
            let mut guard = slot.lock();
            if !guard.dirty {
                continue;
            }
            file.seek(SeekFrom::Start(position))
                .map_err(|source| PackError::IoWrite { position, source })?;
            file.write_all(&guard.bytes)
                .map_err(|source| PackError::IoWrite { position, source })?;
            guard.dirty = false;
        }
        Ok(())
    }

    /// Force all previously flushed writes to stable storage.
    pub fn force(&self) -> Result<()> {
        self.file
            .lock()
            .sync_all()
            .map_err(|source| PackError::IoForce { source })
    }

    /// Flush dirty pages and force, in one call (the common commit-time
    /// durability fence).
    pub fn flush_and_force(&self) -> Result<()> {
        self.flush_dirty()?;
        self.force()
    }

    pub fn close(&self) -> Result<()> {
        self.flush_and_force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_sheaf() -> (Sheaf, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sheaf = Sheaf::open(dir.path().join("test.pack"), 512).unwrap();
        (sheaf, dir)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (sheaf, _dir) = open_test_sheaf();
        sheaf
            .with_page_mut(0, |bytes| bytes[0..5].copy_from_slice(b"hello"))
            .unwrap();
        let page = sheaf.read_page(0).unwrap();
        assert_eq!(&page[0..5], b"hello");
    }

    #[test]
    fn flush_then_reopen_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pack");
        {
            let sheaf = Sheaf::open(&path, 512).unwrap();
            sheaf
                .with_page_mut(512, |bytes| bytes[0..4].copy_from_slice(b"ABCD"))
                .unwrap();
            sheaf.flush_and_force().unwrap();
        }
        let sheaf = Sheaf::open(&path, 512).unwrap();
        let page = sheaf.read_page(512).unwrap();
        assert_eq!(&page[0..4], b"ABCD");
    }

    #[test]
    fn unwritten_page_reads_as_zero() {
        let (sheaf, _dir) = open_test_sheaf();
        let page = sheaf.read_page(4096).unwrap();
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn evict_drops_cached_identity() {
        let (sheaf, _dir) = open_test_sheaf();
        sheaf
            .with_page_mut(0, |bytes| bytes[0] = 0xAB)
            .unwrap();
        sheaf.flush_and_force().unwrap();
        sheaf.evict(0);
        let page = sheaf.read_page(0).unwrap();
        assert_eq!(page[0], 0xAB);
    }
}
