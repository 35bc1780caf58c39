//! By-remaining free-space index: groups non-empty user block pages into
//! alignment buckets keyed by `floor(remaining / alignment)`, each bucket
//! backed by a chain of [`lookup_page`] blocks.
//!
//! Each bucket's chain grows the way SPEC_FULL.md §4.4 describes: its first
//! block is the smallest lookup-block tier, each subsequent block one tier
//! larger, capped at the largest tier once reached. The chain depth (stored
//! as the bucket's `count`) is exactly what determines the tier of each
//! node while walking, so no separate allocation-head table needs to be
//! persisted (see DESIGN.md).

use std::sync::Arc;

use crate::common::{PackError, Position, Result};
use crate::lookup_page::LookupPagePool;
use crate::sheaf::Sheaf;

const FIXED_HEADER_LEN: usize = 16; // alignment(4) + bucket_count(4) + reserved(8)
const BUCKET_ENTRY_LEN: usize = 16; // count(8) + head(8)

pub struct ByRemainingTable {
    sheaf: Arc<Sheaf>,
    lookup: Arc<LookupPagePool>,
    position: Position,
    alignment: u32,
    bucket_count: u32,
}

impl ByRemainingTable {
    /// Create a fresh metadata page at `position`.
    pub fn create(
        sheaf: Arc<Sheaf>,
        lookup: Arc<LookupPagePool>,
        position: Position,
        alignment: u32,
    ) -> Result<Self> {
        let page_size = sheaf.page_size() as usize;
        let available = page_size.saturating_sub(FIXED_HEADER_LEN);
        let max_buckets = (available / BUCKET_ENTRY_LEN) as u32;
        let ideal_buckets = (sheaf.page_size() / alignment) + 1;
        let bucket_count = ideal_buckets.min(max_buckets).max(1);

        let table = Self {
            sheaf,
            lookup,
            position,
            alignment,
            bucket_count,
        };
        table.sheaf.with_page_mut(position, |buf| {
            buf[0..4].copy_from_slice(&alignment.to_be_bytes());
            buf[4..8].copy_from_slice(&bucket_count.to_be_bytes());
        })?;
        Ok(table)
    }

    pub fn open(sheaf: Arc<Sheaf>, lookup: Arc<LookupPagePool>, position: Position) -> Result<Self> {
        let (alignment, bucket_count) = sheaf.with_page(position, |buf| {
            let alignment = u32::from_be_bytes(buf[0..4].try_into().unwrap());
            let bucket_count = u32::from_be_bytes(buf[4..8].try_into().unwrap());
            (alignment, bucket_count)
        })?;
        Ok(Self {
            sheaf,
            lookup,
            position,
            alignment,
            bucket_count,
        })
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Bucket index for a page with `remaining` free bytes.
    pub fn bucket_for(&self, remaining: u32) -> u32 {
        (remaining / self.alignment).min(self.bucket_count - 1)
    }

    fn tier_for_depth(&self, depth: u64) -> usize {
        (depth as usize).min(self.lookup.tier_count() - 1)
    }

    fn bucket_offset(&self, bucket: u32) -> usize {
        FIXED_HEADER_LEN + bucket as usize * BUCKET_ENTRY_LEN
    }

    fn read_bucket(&self, bucket: u32) -> Result<(u64, Position)> {
        let offset = self.bucket_offset(bucket);
        self.sheaf.with_page(self.position, |buf| {
            let count = u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap());
            let head = u64::from_be_bytes(buf[offset + 8..offset + 16].try_into().unwrap());
            (count, head)
        })
    }

    fn write_bucket(&self, bucket: u32, count: u64, head: Position) -> Result<()> {
        let offset = self.bucket_offset(bucket);
        self.sheaf.with_page_mut(self.position, |buf| {
            buf[offset..offset + 8].copy_from_slice(&count.to_be_bytes());
            buf[offset + 8..offset + 16].copy_from_slice(&head.to_be_bytes());
        })
    }

    /// Insert `value` (a user block-page position) into `bucket`.
    pub fn add(&self, bucket: u32, value: u64) -> Result<()> {
        if bucket >= self.bucket_count {
            return Err(PackError::Internal {
                message: format!("bucket {bucket} out of range"),
            });
        }
        let (count, head) = self.read_bucket(bucket)?;
        if count == 0 {
            let block_pos = self.lookup.allocate(0)?;
            self.lookup.block(0, block_pos).push(value)?;
            self.write_bucket(bucket, 1, block_pos)?;
            return Ok(());
        }
        let head_tier = self.tier_for_depth(count - 1);
        let head_block = self.lookup.block(head_tier, head);
        if head_block.push(value)? {
            return Ok(());
        }
        let next_tier = self.tier_for_depth(count);
        let new_block_pos = self.lookup.allocate(next_tier)?;
        let new_block = self.lookup.block(next_tier, new_block_pos);
        new_block.set_next(head)?;
        head_block.set_prev(new_block_pos)?;
        new_block.push(value)?;
        self.write_bucket(bucket, count + 1, new_block_pos)?;
        Ok(())
    }

    /// Remove one occurrence of `value` from `bucket`. Returns whether it
    /// was found.
    pub fn remove(&self, bucket: u32, value: u64) -> Result<bool> {
        let (count, head) = self.read_bucket(bucket)?;
        if head == 0 {
            return Ok(false);
        }
        let mut node = head;
        let mut depth = count - 1;
        loop {
            let tier = self.tier_for_depth(depth);
            let block = self.lookup.block(tier, node);
            if block.values()?.contains(&value) {
                if node == head {
                    block.remove(value)?;
                } else {
                    let head_tier = self.tier_for_depth(count - 1);
                    let head_block = self.lookup.block(head_tier, head);
                    match head_block.pop_last()? {
                        Some(replacement) => {
                            // replace `value` in-place with a spare value
                            // popped from the head, keeping gaps confined
                            // to the head block.
                            block.remove(value)?;
                            block.push(replacement)?;
                        }
                        None => {
                            // head had nothing to lend; fall back to a
                            // direct in-block compaction.
                            block.remove(value)?;
                        }
                    }
                }
                return Ok(true);
            }
            let next = block.next()?;
            if next == 0 {
                return Ok(false);
            }
            node = next;
            depth = depth.saturating_sub(1);
        }
    }

    /// Pop one value from the head of `bucket`'s chain, releasing the head
    /// block back to the lookup pool if it empties.
    pub fn poll(&self, bucket: u32) -> Result<Option<u64>> {
        let (count, head) = self.read_bucket(bucket)?;
        if head == 0 {
            return Ok(None);
        }
        let head_tier = self.tier_for_depth(count - 1);
        let head_block = self.lookup.block(head_tier, head);
        let Some(value) = head_block.pop_last()? else {
            return Ok(None);
        };
        if head_block.is_empty()? {
            let next = head_block.next()?;
            self.lookup.release(head_tier, head)?;
            if next != 0 {
                self.lookup.block(self.tier_for_depth(count.saturating_sub(2)), next).set_prev(0)?;
            }
            self.write_bucket(bucket, count.saturating_sub(1), next)?;
        }
        Ok(Some(value))
    }

    /// Record that a user page at `position` now has `remaining` free bytes,
    /// filing it into the bucket that fits. Convenience wrapper over `add`
    /// for call sites that think in terms of a page's remaining space
    /// rather than a bucket index.
    pub fn track(&self, position: Position, remaining: u32) -> Result<()> {
        self.add(self.bucket_for(remaining), position)
    }

    /// Remove `position` from whichever bucket it was filed under for
    /// `remaining` bytes. Counterpart to [`Self::track`].
    pub fn untrack(&self, position: Position, remaining: u32) -> Result<bool> {
        self.remove(self.bucket_for(remaining), position)
    }

    /// Find the smallest bucket whose remaining-bytes floor is at least
    /// `min_remaining` and that currently has an entry, removing and
    /// returning one page position from it (best-fit, SPEC_FULL.md §4.4).
    pub fn best_fit(&self, min_remaining: u32) -> Result<Option<Position>> {
        let start = self.bucket_for(min_remaining);
        for bucket in start..self.bucket_count {
            if let Some(value) = self.poll(bucket)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interim_pool::InterimPagePool;
    use tempfile::tempdir;

    fn table() -> (ByRemainingTable, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("r.pack"), 512).unwrap());
        let interim = Arc::new(InterimPagePool::new(sheaf.clone(), 4096));
        let lookup = Arc::new(LookupPagePool::new(sheaf.clone(), interim, vec![4, 8, 16]));
        let table = ByRemainingTable::create(sheaf, lookup, 0, 64).unwrap();
        (table, dir)
    }

    #[test]
    fn add_then_poll_round_trips() {
        let (table, _dir) = table();
        table.add(0, 4096).unwrap();
        assert_eq!(table.poll(0).unwrap(), Some(4096));
        assert_eq!(table.poll(0).unwrap(), None);
    }

    #[test]
    fn chain_grows_across_tiers() {
        let (table, _dir) = table();
        // tier 0 capacity is 4; push enough values to force at least two
        // chain links.
        for i in 1..=10u64 {
            table.add(3, i * 100).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(v) = table.poll(3).unwrap() {
            seen.push(v);
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn remove_from_middle_of_chain_preserves_other_values() {
        let (table, _dir) = table();
        for i in 1..=8u64 {
            table.add(1, i).unwrap();
        }
        assert!(table.remove(1, 3).unwrap());
        assert!(!table.remove(1, 3).unwrap());
        let mut remaining = Vec::new();
        while let Some(v) = table.poll(1).unwrap() {
            remaining.push(v);
        }
        assert_eq!(remaining.len(), 7);
        assert!(!remaining.contains(&3));
    }

    #[test]
    fn best_fit_finds_bucket_at_or_above_requirement() {
        let (table, _dir) = table();
        table.add(2, 500).unwrap();
        table.add(5, 600).unwrap();
        let found = table.best_fit(table.alignment * 4).unwrap();
        assert_eq!(found, Some(500));
    }

    #[test]
    fn track_and_untrack_round_trip_through_the_right_bucket() {
        let (table, _dir) = table();
        table.track(4096, 500).unwrap();
        assert!(table.untrack(4096, 500).unwrap());
        assert!(!table.untrack(4096, 500).unwrap());
    }

    #[test]
    fn bucket_index_clamps_to_last_bucket() {
        let (table, _dir) = table();
        let huge_remaining = u32::MAX / 2;
        let bucket = table.bucket_for(huge_remaining);
        assert!(bucket < table.bucket_count);
    }
}
