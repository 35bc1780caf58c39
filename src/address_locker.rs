//! Address locker: short-lived per-address latches preventing a reallocation
//! race across a `FREE`'s commit fence (SPEC_FULL.md §4.9).
//!
//! A fixed-arity array of buckets, each a `HashSet` of currently-latched
//! addresses guarded by a `parking_lot::Condvar`. Hashing an address down to
//! a small, fixed bucket count means two distinct addresses can collide and
//! block each other unnecessarily, but never lets the set of outstanding
//! latches grow unboundedly, matching the leaf-lock role this plays in the
//! lock hierarchy (SPEC_FULL.md §5).

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use parking_lot::{Condvar, Mutex};

use crate::common::Address;

struct Bucket {
    latched: Mutex<HashSet<Address>>,
    condvar: Condvar,
}

impl Bucket {
    fn new() -> Self {
        Self {
            latched: Mutex::new(HashSet::new()),
            condvar: Condvar::new(),
        }
    }
}

pub struct AddressLocker {
    buckets: Vec<Bucket>,
}

impl AddressLocker {
    pub fn new(bucket_count: u32) -> Self {
        let bucket_count = bucket_count.max(1) as usize;
        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
        }
    }

    fn bucket_for(&self, address: Address) -> &Bucket {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        address.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[index]
    }

    /// Block while `address` is already latched by another holder, then
    /// latch it for this caller. Returns a guard that unlatches and wakes
    /// waiters on drop.
    pub fn latch(&self, address: Address) -> AddressLatch<'_> {
        let bucket = self.bucket_for(address);
        let mut latched = bucket.latched.lock();
        while latched.contains(&address) {
            bucket.condvar.wait(&mut latched);
        }
        latched.insert(address);
        AddressLatch {
            locker: self,
            address,
        }
    }

    /// Block until `address` is not latched, without taking the latch.
    /// Used by a dereference that must not proceed while a `FREE` is still
    /// in flight for the same address.
    pub fn bide(&self, address: Address) {
        let bucket = self.bucket_for(address);
        let mut latched = bucket.latched.lock();
        while latched.contains(&address) {
            bucket.condvar.wait(&mut latched);
        }
    }

    fn unlatch(&self, address: Address) {
        let bucket = self.bucket_for(address);
        let mut latched = bucket.latched.lock();
        latched.remove(&address);
        bucket.condvar.notify_all();
    }

    pub fn held_count(&self) -> usize {
        self.buckets.iter().map(|b| b.latched.lock().len()).sum()
    }
}

/// RAII handle for one held latch. Released on drop, which is what bounds
/// the window a reallocation race can occur in to "while this guard lives".
pub struct AddressLatch<'a> {
    locker: &'a AddressLocker,
    address: Address,
}

impl Drop for AddressLatch<'_> {
    fn drop(&mut self) {
        self.locker.unlatch(self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn latch_then_drop_releases_it() {
        let locker = AddressLocker::new(8);
        assert_eq!(locker.held_count(), 0);
        {
            let _latch = locker.latch(64);
            assert_eq!(locker.held_count(), 1);
        }
        assert_eq!(locker.held_count(), 0);
    }

    #[test]
    fn second_latch_blocks_until_first_drops() {
        let locker = Arc::new(AddressLocker::new(8));
        let first = locker.latch(128);

        let locker2 = locker.clone();
        let handle = thread::spawn(move || {
            let _second = locker2.latch(128);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(locker.held_count(), 1);
        drop(first);
        handle.join().unwrap();
        assert_eq!(locker.held_count(), 0);
    }

    #[test]
    fn bide_returns_immediately_when_unlatched() {
        let locker = AddressLocker::new(8);
        locker.bide(256);
    }

    #[test]
    fn distinct_addresses_do_not_block_each_other_in_distinct_buckets() {
        let locker = AddressLocker::new(64);
        let _a = locker.latch(1);
        let _b = locker.latch(2);
        assert_eq!(locker.held_count(), 2);
    }
}
