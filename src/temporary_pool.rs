//! Temporary pool: a persistent singly-linked list of 16-byte reference
//! nodes anchored at the header's `first_temporary_node` field.
//!
//! Each node is `{blockAddress:8, nextNode:8}`. Binding a node pushes it
//! onto the head of the list; the chain is append-only (a bound node is
//! never unlinked), so nodes are carved from interim pages the same way
//! [`crate::lookup_page`] carves fixed-size blocks, and a node's storage is
//! never returned to the allocation freelist once bound. On open, every
//! node with a non-zero bound address names a block that did not survive
//! the restart and must be freed (SPEC_FULL.md §4.9, §6).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{Address, Position, Result};
use crate::interim_pool::InterimPagePool;
use crate::sheaf::Sheaf;

const NODE_LEN: usize = 16;

fn decode(byte_offset: Position, page_size: u32) -> (Position, usize) {
    let page_size = page_size as u64;
    let local = byte_offset % page_size;
    (byte_offset - local, local as usize)
}

pub struct TemporaryPool {
    sheaf: Arc<Sheaf>,
    interim: Arc<InterimPagePool>,
    free: Mutex<Vec<Address>>,
    head: AtomicU64,
}

impl TemporaryPool {
    pub fn new(sheaf: Arc<Sheaf>, interim: Arc<InterimPagePool>, initial_head: Address) -> Self {
        Self {
            sheaf,
            interim,
            free: Mutex::new(Vec::new()),
            head: AtomicU64::new(initial_head),
        }
    }

    /// Current head of the persistent chain; callers persist this into the
    /// header's `first_temporary_node` field alongside other geometry.
    pub fn head(&self) -> Address {
        self.head.load(Ordering::Acquire)
    }

    fn read_node(&self, node: Address) -> Result<(Address, Address)> {
        let (page, local) = decode(node, self.sheaf.page_size());
        self.sheaf.with_page(page, |buf| {
            let block = u64::from_be_bytes(buf[local..local + 8].try_into().unwrap());
            let next = u64::from_be_bytes(buf[local + 8..local + 16].try_into().unwrap());
            (block, next)
        })
    }

    fn write_node(&self, node: Address, block: Address, next: Address) -> Result<()> {
        let (page, local) = decode(node, self.sheaf.page_size());
        self.sheaf.with_page_mut(page, |buf| {
            buf[local..local + 8].copy_from_slice(&block.to_be_bytes());
            buf[local + 8..local + 16].copy_from_slice(&next.to_be_bytes());
        })
    }

    /// Carve a fresh, unbound node (zeroed) from the pool.
    pub fn allocate(&self) -> Result<Address> {
        {
            let mut free = self.free.lock();
            if let Some(node) = free.pop() {
                return Ok(node);
            }
        }
        let page = self.interim.allocate()?;
        let page_size = self.sheaf.page_size() as usize;
        let nodes_per_page = page_size / NODE_LEN;
        let mut free = self.free.lock();
        for i in 1..nodes_per_page {
            free.push(page + (i * NODE_LEN) as u64);
        }
        Ok(page)
    }

    /// Return a freshly carved but never-bound node to the free list. Used
    /// by a mutator's rollback to undo a `temporary()` call that never made
    /// it into a journal that got replayed.
    pub fn release_unbound(&self, node: Address) {
        self.free.lock().push(node);
    }

    /// Push `node` onto the head of the persistent chain, bound to
    /// `block_address`. Idempotent when `node` already heads the chain
    /// bound to the same address (the replay case).
    pub fn bind(&self, node: Address, block_address: Address) -> Result<()> {
        if self.head() == node {
            let (current_block, _) = self.read_node(node)?;
            if current_block == block_address {
                return Ok(());
            }
        }
        let old_head = self.head();
        self.write_node(node, block_address, old_head)?;
        self.head.store(node, Ordering::Release);
        Ok(())
    }

    /// Clear `node`'s bound address without unlinking it from the chain.
    /// Used once the block it names has been freed, so a later recovery
    /// sweep does not free it again.
    pub fn tombstone(&self, node: Address) -> Result<()> {
        let (_, next) = self.read_node(node)?;
        self.write_node(node, 0, next)
    }

    /// Every block address still bound by a node in the chain, head first.
    /// Recovery frees each of these, then tombstones its node.
    pub fn bound_addresses(&self) -> Result<Vec<(Address, Address)>> {
        let mut result = Vec::new();
        let mut node = self.head();
        while node != 0 {
            let (block, next) = self.read_node(node)?;
            if block != 0 {
                result.push((node, block));
            }
            node = next;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool() -> (TemporaryPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("t.pack"), 512).unwrap());
        let interim = Arc::new(InterimPagePool::new(sheaf.clone(), 4096));
        (TemporaryPool::new(sheaf, interim, 0), dir)
    }

    #[test]
    fn bind_pushes_onto_head_and_chains_to_prior_head() {
        let (pool, _dir) = pool();
        let n1 = pool.allocate().unwrap();
        pool.bind(n1, 100).unwrap();
        assert_eq!(pool.head(), n1);

        let n2 = pool.allocate().unwrap();
        pool.bind(n2, 200).unwrap();
        assert_eq!(pool.head(), n2);

        let bound = pool.bound_addresses().unwrap();
        assert_eq!(bound, vec![(n2, 200), (n1, 100)]);
    }

    #[test]
    fn rebinding_the_head_with_the_same_address_is_idempotent() {
        let (pool, _dir) = pool();
        let n1 = pool.allocate().unwrap();
        pool.bind(n1, 100).unwrap();
        pool.bind(n1, 100).unwrap();
        assert_eq!(pool.bound_addresses().unwrap(), vec![(n1, 100)]);
    }

    #[test]
    fn tombstone_clears_the_bound_address_but_keeps_the_chain_intact() {
        let (pool, _dir) = pool();
        let n1 = pool.allocate().unwrap();
        pool.bind(n1, 100).unwrap();
        let n2 = pool.allocate().unwrap();
        pool.bind(n2, 200).unwrap();

        pool.tombstone(n1).unwrap();
        let bound = pool.bound_addresses().unwrap();
        assert_eq!(bound, vec![(n2, 200)]);
        assert_eq!(pool.head(), n2);
    }

    #[test]
    fn allocate_reuses_carved_nodes_from_the_same_page() {
        let (pool, _dir) = pool();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a / 4096, b / 4096); // same interim page, since page holds many nodes
    }
}
