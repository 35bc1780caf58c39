//! Interim page pool: a process-local freelist of interim-region positions.
//!
//! Grounded on the growable-array-plus-freelist shape of a fixed-page
//! allocator, simplified from epoch-deferred reclamation to plain mutex
//! serialization, since the spec calls for serialized (not lock-free)
//! access to this pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{Position, Result};
use crate::sheaf::Sheaf;

pub struct InterimPagePool {
    sheaf: Arc<Sheaf>,
    free: Mutex<Vec<Position>>,
    high_water: AtomicU64,
}

impl InterimPagePool {
    /// `start` is the first position available to the pool (the start of
    /// the interim region).
    pub fn new(sheaf: Arc<Sheaf>, start: Position) -> Self {
        Self {
            sheaf,
            free: Mutex::new(Vec::new()),
            high_water: AtomicU64::new(start),
        }
    }

    /// Hand out a fresh, zero-initialized page position.
    pub fn allocate(&self) -> Result<Position> {
        let mut free = self.free.lock();
        if let Some(position) = free.pop() {
            self.sheaf.zero_page(position)?;
            return Ok(position);
        }
        drop(free);
        self.bump_high_water()
    }

    /// Hand out a fresh page position, always extending the high-water mark
    /// rather than reusing a released one.
    ///
    /// Address-region growth (`Bouquet::grow_address_region`) must use this
    /// instead of [`Self::allocate`]: growth promotes whatever page
    /// currently sits at the address boundary, and needs its destination to
    /// be a position strictly beyond the boundary's *next* value too, not
    /// just its current one. A released page reused from the free list could
    /// coincide with that next boundary position (another mutator may have
    /// leased and rolled back exactly that slot), which would make a
    /// following promotion's source and destination collide. Always bumping
    /// keeps (high-water − boundary) constant at whatever gap growth started
    /// with, forever (see DESIGN.md).
    pub fn allocate_fresh(&self) -> Result<Position> {
        self.bump_high_water()
    }

    fn bump_high_water(&self) -> Result<Position> {
        let page_size = self.sheaf.page_size() as u64;
        let position = self.high_water.fetch_add(page_size, Ordering::AcqRel);
        self.sheaf.ensure_len(position)?;
        self.sheaf.zero_page(position)?;
        Ok(position)
    }

    /// Return a page to the pool for reuse. The page is zeroed immediately
    /// so a crash between release and reuse cannot leak stale content.
    pub fn release(&self, position: Position) -> Result<()> {
        self.sheaf.zero_page(position)?;
        self.free.lock().push(position);
        Ok(())
    }

    pub fn high_water(&self) -> Position {
        self.high_water.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool() -> (InterimPagePool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("i.pack"), 512).unwrap());
        (InterimPagePool::new(sheaf, 4096), dir)
    }

    #[test]
    fn allocate_grows_high_water() {
        let (pool, _dir) = pool();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a, 4096);
        assert_eq!(b, 4608);
    }

    #[test]
    fn released_pages_are_reused() {
        let (pool, _dir) = pool();
        let a = pool.allocate().unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.free_count(), 1);
        let b = pool.allocate().unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn released_pages_are_zeroed() {
        let (pool, _dir) = pool();
        let a = pool.allocate().unwrap();
        pool.sheaf
            .with_page_mut(a, |bytes| bytes[0] = 0xAB)
            .unwrap();
        pool.release(a).unwrap();
        let page = pool.sheaf.read_page(a).unwrap();
        assert!(page.iter().all(|&b| b == 0));
    }
}
