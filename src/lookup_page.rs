//! Lookup pages: doubly-linked blocks of 64-bit values used by the
//! by-remaining free-space index.
//!
//! A *block* here is a fixed-size region inside a lookup page (a real,
//! page-aligned file page), not the page itself: several buckets can share
//! one lookup page for blocks of the same size. A block is identified by
//! its absolute byte offset, exactly like a block-page address; callers
//! resolve that offset back to its containing page before touching bytes,
//! so the sheaf's page cache is only ever keyed by page-aligned positions.
//!
//! Grounded on the growable free-list pattern of a fixed-page allocator,
//! carved at block rather than page granularity.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{PackError, Position, Result};
use crate::interim_pool::InterimPagePool;
use crate::sheaf::Sheaf;

const BLOCK_HEADER_LEN: usize = 16; // prev(8) + next(8)

fn decode(byte_offset: Position, page_size: u32) -> (Position, usize) {
    let page_size = page_size as u64;
    let local = byte_offset % page_size;
    (byte_offset - local, local as usize)
}

/// A single fixed-capacity doubly-linked block of values.
pub struct LookupBlock<'a> {
    sheaf: &'a Sheaf,
    page: Position,
    local: usize,
    capacity: usize,
}

impl<'a> LookupBlock<'a> {
    pub fn at(sheaf: &'a Sheaf, byte_offset: Position, capacity: usize) -> Self {
        let (page, local) = decode(byte_offset, sheaf.page_size());
        Self {
            sheaf,
            page,
            local,
            capacity,
        }
    }

    pub fn byte_offset(&self) -> Position {
        self.page + self.local as u64
    }

    fn values_offset(&self) -> usize {
        self.local + BLOCK_HEADER_LEN
    }

    pub fn prev(&self) -> Result<Position> {
        self.sheaf.with_page(self.page, |buf| {
            u64::from_be_bytes(buf[self.local..self.local + 8].try_into().unwrap())
        })
    }

    pub fn next(&self) -> Result<Position> {
        self.sheaf.with_page(self.page, |buf| {
            u64::from_be_bytes(buf[self.local + 8..self.local + 16].try_into().unwrap())
        })
    }

    pub fn set_prev(&self, value: Position) -> Result<()> {
        self.sheaf.with_page_mut(self.page, |buf| {
            buf[self.local..self.local + 8].copy_from_slice(&value.to_be_bytes());
        })
    }

    pub fn set_next(&self, value: Position) -> Result<()> {
        self.sheaf.with_page_mut(self.page, |buf| {
            buf[self.local + 8..self.local + 16].copy_from_slice(&value.to_be_bytes());
        })
    }

    /// Values in order, stopping at the first zero slot.
    pub fn values(&self) -> Result<Vec<u64>> {
        let offset = self.values_offset();
        let capacity = self.capacity;
        self.sheaf.with_page(self.page, |buf| {
            let mut values = Vec::with_capacity(capacity);
            for i in 0..capacity {
                let start = offset + i * 8;
                let v = u64::from_be_bytes(buf[start..start + 8].try_into().unwrap());
                if v == 0 {
                    break;
                }
                values.push(v);
            }
            values
        })
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.values()?.len() == self.capacity)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.values()?.is_empty())
    }

    /// Append a value if there is room.
    pub fn push(&self, value: u64) -> Result<bool> {
        let offset = self.values_offset();
        let capacity = self.capacity;
        self.sheaf.with_page_mut(self.page, |buf| {
            for i in 0..capacity {
                let start = offset + i * 8;
                let current = u64::from_be_bytes(buf[start..start + 8].try_into().unwrap());
                if current == 0 {
                    buf[start..start + 8].copy_from_slice(&value.to_be_bytes());
                    return true;
                }
            }
            false
        })
    }

    /// Remove the last non-zero value ("pop from the tail"); used to
    /// refill an emptying head from the allocation block.
    pub fn pop_last(&self) -> Result<Option<u64>> {
        let offset = self.values_offset();
        let capacity = self.capacity;
        self.sheaf.with_page_mut(self.page, |buf| {
            for i in (0..capacity).rev() {
                let start = offset + i * 8;
                let current = u64::from_be_bytes(buf[start..start + 8].try_into().unwrap());
                if current != 0 {
                    buf[start..start + 8].copy_from_slice(&0u64.to_be_bytes());
                    return Some(current);
                }
            }
            None
        })
    }

    /// Remove one occurrence of `value`, closing the gap by shifting later
    /// values down by one slot. Only the head block is ever asked to do
    /// this, preserving the invariant that non-head blocks stay full.
    pub fn remove(&self, value: u64) -> Result<bool> {
        let offset = self.values_offset();
        let capacity = self.capacity;
        self.sheaf.with_page_mut(self.page, |buf| {
            let mut found = None;
            let mut values = Vec::with_capacity(capacity);
            for i in 0..capacity {
                let start = offset + i * 8;
                let v = u64::from_be_bytes(buf[start..start + 8].try_into().unwrap());
                if v == 0 {
                    break;
                }
                if v == value && found.is_none() {
                    found = Some(i);
                    continue;
                }
                values.push(v);
            }
            if found.is_none() {
                return false;
            }
            for i in 0..capacity {
                let start = offset + i * 8;
                let v = values.get(i).copied().unwrap_or(0);
                buf[start..start + 8].copy_from_slice(&v.to_be_bytes());
            }
            true
        })
    }

    pub fn clear(&self) -> Result<()> {
        let offset = self.values_offset();
        let capacity = self.capacity;
        self.sheaf.with_page_mut(self.page, |buf| {
            buf[self.local..self.local + 16].fill(0);
            for i in 0..capacity {
                let start = offset + i * 8;
                buf[start..start + 8].fill(0);
            }
        })
    }
}

/// Strictly-increasing ladder of block capacities (in values), and the
/// growable pool of file pages carved into blocks of each tier.
pub struct LookupPagePool {
    sheaf: Arc<Sheaf>,
    interim: Arc<InterimPagePool>,
    tier_capacities: Vec<usize>,
    free: Mutex<Vec<Vec<Position>>>,
}

impl LookupPagePool {
    pub fn new(sheaf: Arc<Sheaf>, interim: Arc<InterimPagePool>, tier_capacities: Vec<u32>) -> Self {
        let tiers = tier_capacities.len();
        Self {
            sheaf,
            interim,
            tier_capacities: tier_capacities.into_iter().map(|v| v as usize).collect(),
            free: Mutex::new(vec![Vec::new(); tiers]),
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tier_capacities.len()
    }

    pub fn capacity(&self, tier: usize) -> usize {
        self.tier_capacities[tier]
    }

    fn block_bytes(&self, tier: usize) -> usize {
        BLOCK_HEADER_LEN + self.tier_capacities[tier] * 8
    }

    /// Hand out a fresh, empty block of the given tier.
    pub fn allocate(&self, tier: usize) -> Result<Position> {
        if tier >= self.tier_capacities.len() {
            return Err(PackError::Internal {
                message: format!("lookup tier {tier} out of range"),
            });
        }
        {
            let mut free = self.free.lock();
            if let Some(position) = free[tier].pop() {
                return Ok(position);
            }
        }
        let page = self.interim.allocate()?;
        let block_bytes = self.block_bytes(tier);
        let page_size = self.sheaf.page_size() as usize;
        let blocks_per_page = page_size / block_bytes;
        if blocks_per_page == 0 {
            return Err(PackError::Internal {
                message: format!("lookup block for tier {tier} does not fit in a page"),
            });
        }
        let mut free = self.free.lock();
        for i in 1..blocks_per_page {
            free[tier].push(page + (i * block_bytes) as u64);
        }
        Ok(page)
    }

    /// Return a block of the given tier to the pool, clearing its contents.
    pub fn release(&self, tier: usize, byte_offset: Position) -> Result<()> {
        LookupBlock::at(&self.sheaf, byte_offset, self.tier_capacities[tier]).clear()?;
        self.free.lock()[tier].push(byte_offset);
        Ok(())
    }

    pub fn block(&self, tier: usize, byte_offset: Position) -> LookupBlock<'_> {
        LookupBlock::at(&self.sheaf, byte_offset, self.tier_capacities[tier])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool() -> (LookupPagePool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("l.pack"), 512).unwrap());
        let interim = Arc::new(InterimPagePool::new(sheaf.clone(), 4096));
        (
            LookupPagePool::new(sheaf, interim, vec![4, 8, 16]),
            dir,
        )
    }

    #[test]
    fn push_and_values_round_trip() {
        let (pool, _dir) = pool();
        let b = pool.allocate(0).unwrap();
        let block = pool.block(0, b);
        assert!(block.push(10).unwrap());
        assert!(block.push(20).unwrap());
        assert_eq!(block.values().unwrap(), vec![10, 20]);
    }

    #[test]
    fn block_reports_full_at_capacity() {
        let (pool, _dir) = pool();
        let b = pool.allocate(0).unwrap();
        let block = pool.block(0, b);
        for v in 1..=4 {
            assert!(block.push(v).unwrap());
        }
        assert!(block.is_full().unwrap());
        assert!(!block.push(5).unwrap());
    }

    #[test]
    fn remove_closes_the_gap() {
        let (pool, _dir) = pool();
        let b = pool.allocate(0).unwrap();
        let block = pool.block(0, b);
        block.push(1).unwrap();
        block.push(2).unwrap();
        block.push(3).unwrap();
        assert!(block.remove(2).unwrap());
        assert_eq!(block.values().unwrap(), vec![1, 3]);
    }

    #[test]
    fn multiple_blocks_in_one_page_are_independent() {
        let (pool, _dir) = pool();
        let a = pool.allocate(0).unwrap();
        let b = pool.allocate(0).unwrap();
        assert_ne!(a, b);
        pool.block(0, a).push(1).unwrap();
        pool.block(0, b).push(2).unwrap();
        assert_eq!(pool.block(0, a).values().unwrap(), vec![1]);
        assert_eq!(pool.block(0, b).values().unwrap(), vec![2]);
    }

    #[test]
    fn released_block_is_reused_and_cleared() {
        let (pool, _dir) = pool();
        let a = pool.allocate(0).unwrap();
        pool.block(0, a).push(99).unwrap();
        pool.release(0, a).unwrap();
        let b = pool.allocate(0).unwrap();
        assert_eq!(a, b);
        assert!(pool.block(0, b).values().unwrap().is_empty());
    }
}
