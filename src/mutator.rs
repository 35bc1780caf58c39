//! Mutator: the client-facing transaction handle (SPEC_FULL.md §4.8).
//!
//! A mutator accumulates a sequence of operations in memory, then commits
//! them atomically by writing them to a journal, flushing, and replaying
//! that journal through the same [`crate::player::Player`] recovery uses.
//! Nothing the mutator does is visible to other mutators until `commit`
//! returns; `rollback` (or dropping the mutator without committing) undoes
//! whatever reservations were made so far.
//!
//! Grounded on the teacher's `RsKv::upsert`/`delete` request shape
//! (`rskv.rs`), generalized from single-record log appends to a batch of
//! pending operations flushed through a journal at commit time.

use std::sync::Arc;

use crate::address_page::AddressPage;
use crate::block_page::BlockPage;
use crate::bouquet::Bouquet;
use crate::common::{Address, PackError, Position, Result, FREE_SLOT, RESERVED_SLOT};
use crate::journal::{JournalWriter, Operation};

/// Maximum number of retries for a read racing a concurrent vacuum move.
const READ_RETRY_LIMIT: usize = 8;

/// A client transaction against one open [`crate::pack::Pack`].
///
/// Not `Send` across an await point while holding `current_block_page` open
/// is not a concern here: every field is plain data or an `Arc`, so the
/// mutator itself is both `Send` and `Sync`-free-to-move, but a single
/// mutator is meant to be driven by one task at a time, matching the
/// teacher's one-call-at-a-time `RsKv` method shape.
pub struct Mutator {
    bouquet: Arc<Bouquet>,
    pending_ops: Vec<Operation>,
    reserved: Vec<Address>,
    interim_pages: Vec<Position>,
    temp_nodes: Vec<Address>,
    current_block_page: Option<Position>,
    finished: bool,
}

impl Mutator {
    pub(crate) fn new(bouquet: Arc<Bouquet>) -> Self {
        Self {
            bouquet,
            pending_ops: Vec::new(),
            reserved: Vec::new(),
            interim_pages: Vec::new(),
            temp_nodes: Vec::new(),
            current_block_page: None,
            finished: false,
        }
    }

    fn address_page_for(&self, address: Address) -> AddressPage<'_> {
        let page_size = self.bouquet.sheaf.page_size() as u64;
        let page_start = address - (address % page_size);
        AddressPage::new(&self.bouquet.sheaf, page_start, 1)
    }

    /// Find or create an interim block page with room for `payload_len`
    /// bytes, reusing the mutator's current scratch page when it still has
    /// space.
    ///
    /// This does *not* consult the by-remaining table: that index only
    /// tracks committed, replayed user pages, not a mutator's own pre-commit
    /// interim scratch (see DESIGN.md's Open Question decision on §4.8).
    fn block_for(&mut self, payload_len: usize) -> Result<Position> {
        let footprint = crate::block_page::BLOCK_HEADER_LEN + payload_len;
        if let Some(position) = self.current_block_page {
            let page = BlockPage::new(&self.bouquet.sheaf, position, false);
            if page.remaining()? as usize >= footprint {
                return Ok(position);
            }
        }
        let position = self.bouquet.interim.allocate()?;
        let page = BlockPage::new(&self.bouquet.sheaf, position, false);
        page.initialize()?;
        self.interim_pages.push(position);
        self.current_block_page = Some(position);
        Ok(position)
    }

    /// Reserve a fresh address and an interim block with room for `size`
    /// bytes, with no payload written yet. Not visible to other mutators
    /// until `commit`; call [`Self::write`] to give it content.
    pub async fn allocate(&mut self, size: usize) -> Result<Address> {
        self.bouquet.ensure_address_capacity()?;
        let address = loop {
            let page_position = self.bouquet.address_pages.reserve()?;
            let page = self.address_page_for(page_position);
            if let Some(address) = page.reserve()? {
                break address;
            }
        };
        self.reserved.push(address);

        let interim_pos = self.block_for(size)?;
        let page = BlockPage::new(&self.bouquet.sheaf, interim_pos, false);
        page.allocate(address, size)?;

        self.pending_ops.push(Operation::Write { address, interim_pos });
        self.bouquet.metrics.record_allocation();
        Ok(address)
    }

    /// Write a new payload for an address that already exists, superseding
    /// whatever block currently backs it. The superseded block is tombstoned
    /// by the player during replay, not here.
    pub async fn write(&mut self, address: Address, payload: &[u8]) -> Result<()> {
        let interim_pos = self.block_for(payload.len())?;
        let page = BlockPage::new(&self.bouquet.sheaf, interim_pos, false);
        page.allocate(address, payload.len())?;
        page.write(address, payload)?;

        self.pending_ops.push(Operation::Write { address, interim_pos });
        Ok(())
    }

    /// Free `address`. Rejected for any address installed in the static
    /// block map.
    pub async fn free(&mut self, address: Address) -> Result<()> {
        if self.bouquet.is_static_address(address) {
            return Err(PackError::FreedStaticAddress { address });
        }
        self.pending_ops.push(Operation::Free { address });
        self.bouquet.metrics.record_free();
        Ok(())
    }

    /// Allocate a block the same as [`Self::allocate`], but also bind a
    /// temporary-pool node to it so an open-time recovery sweep frees it if
    /// this process never gets a chance to free it itself.
    pub async fn temporary(&mut self, size: usize) -> Result<Address> {
        let address = self.allocate(size).await?;
        let node = self.bouquet.temporary.allocate()?;
        self.temp_nodes.push(node);
        self.pending_ops.push(Operation::Temporary { address, temp_node: node });
        self.bouquet.metrics.record_temporary_allocation();
        Ok(address)
    }

    /// Read the current payload bound to `address`, or `None` if it has been
    /// freed. Retries a bounded number of times if a concurrent vacuum moves
    /// the block between dereferencing the address and reading it
    /// (SPEC_FULL.md §5).
    pub async fn read(&self, address: Address) -> Result<Option<Vec<u8>>> {
        for _ in 0..READ_RETRY_LIMIT {
            let _guard = self.bouquet.boundary.read();
            let page = self.address_page_for(address);
            let raw = page.raw(address)?;
            if raw == FREE_SLOT || raw == RESERVED_SLOT {
                return Ok(None);
            }
            let position = self.bouquet.boundary.adjust(raw)?;
            drop(_guard);

            let block = BlockPage::new(&self.bouquet.sheaf, position, true);
            match block.read(address)? {
                Some(payload) => return Ok(Some(payload)),
                None => continue,
            }
        }
        Ok(None)
    }

    /// Commit every pending operation atomically: journal it, flush, and
    /// replay the journal through the same player recovery uses.
    pub async fn commit(mut self) -> Result<()> {
        let mut writer = JournalWriter::new(self.bouquet.sheaf.clone(), self.bouquet.interim.clone())?;
        for op in &self.pending_ops {
            writer.append(*op)?;
        }
        writer.append(Operation::Commit)?;
        writer.append(Operation::Terminate)?;
        let journal_pages = writer.pages().to_vec();
        let bytes_written = writer.bytes_written();
        let start = writer.finish()?;

        self.bouquet.sheaf.flush_and_force()?;

        let slot = self.bouquet.journal_slots.acquire()?;
        self.bouquet.journal_slots.set(slot, start);
        self.bouquet.persist_header(false)?;

        self.bouquet.player().replay(start)?;

        self.bouquet.journal_slots.release(slot);
        self.bouquet.persist_header(false)?;

        // Only the journal's own scratch pages go back to the interim pool.
        // `self.interim_pages` now hold permanently-live committed user
        // blocks and must never be released.
        for page in journal_pages {
            self.bouquet.interim.release(page)?;
        }

        self.bouquet.metrics.record_commit();
        self.bouquet.metrics.record_journal_bytes_written(bytes_written);
        self.finished = true;
        Ok(())
    }

    /// Undo every reservation made so far. No journal is written.
    pub async fn rollback(mut self) -> Result<()> {
        for address in &self.reserved {
            self.address_page_for(*address).free(*address)?;
        }
        for page in &self.interim_pages {
            self.bouquet.interim.release(*page)?;
        }
        for node in &self.temp_nodes {
            self.bouquet.temporary.release_unbound(*node);
        }
        self.bouquet.metrics.record_rollback();
        self.finished = true;
        Ok(())
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if !self.finished && (!self.pending_ops.is_empty() || !self.reserved.is_empty()) {
            log::warn!(
                "mutator dropped with {} pending operation(s) and {} reservation(s) discarded; \
                 call commit() or rollback() explicitly",
                self.pending_ops.len(),
                self.reserved.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::options::Options;
    use crate::sheaf::Sheaf;
    use tempfile::tempdir;

    fn bouquet() -> (Arc<Bouquet>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let options = Options::default();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("m.pack"), options.page_size).unwrap());
        let header = Header::fresh(&options);
        let boundary = Arc::new(crate::address_boundary::AddressBoundary::new(
            sheaf.clone(),
            header.address_boundary,
        ));
        let interim_start = header.address_boundary + options.page_size as u64;
        let interim = Arc::new(crate::interim_pool::InterimPagePool::new(sheaf.clone(), interim_start));
        let lookup = Arc::new(crate::lookup_page::LookupPagePool::new(
            sheaf.clone(),
            interim.clone(),
            options.lookup_block_sizes.clone(),
        ));
        let by_remaining_pos = interim.allocate().unwrap();
        let by_remaining = Arc::new(
            crate::by_remaining::ByRemainingTable::create(
                sheaf.clone(),
                lookup.clone(),
                by_remaining_pos,
                options.alignment,
            )
            .unwrap(),
        );
        let address_pages = Arc::new(crate::address_page_pool::AddressPagePool::new(
            sheaf.clone(),
            boundary.clone(),
        ));
        let locker = Arc::new(crate::address_locker::AddressLocker::new(options.address_locker_buckets));
        let temporary = Arc::new(crate::temporary_pool::TemporaryPool::new(
            sheaf.clone(),
            interim.clone(),
            0,
        ));
        let journal_slots = Arc::new(crate::bouquet::JournalSlots::new(vec![0; options.journal_count as usize]));
        let metrics = Arc::new(crate::metrics::MetricsCollector::new());
        let vacuum_tracker = Arc::new(crate::vacuum_tracker::VacuumTracker::new());

        let mut header = header;
        header.by_remaining_table = by_remaining_pos;
        let bouquet = Arc::new(Bouquet {
            sheaf,
            boundary,
            interim,
            lookup,
            by_remaining,
            address_pages,
            locker,
            temporary,
            journal_slots,
            metrics,
            vacuum_tracker,
            vacuum_mutex: parking_lot::Mutex::new(()),
            options,
            header: parking_lot::Mutex::new(header),
        });
        bouquet.persist_header(false).unwrap();
        (bouquet, dir)
    }

    #[tokio::test]
    async fn allocate_then_write_then_commit_is_visible_to_a_new_mutator() {
        let (bouquet, _dir) = bouquet();
        let mut mutator = Mutator::new(bouquet.clone());
        let address = mutator.allocate(5).await.unwrap();
        mutator.write(address, b"hello").await.unwrap();
        mutator.commit().await.unwrap();

        let reader = Mutator::new(bouquet);
        assert_eq!(reader.read(address).await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn rollback_frees_reserved_addresses() {
        let (bouquet, _dir) = bouquet();
        let mut mutator = Mutator::new(bouquet.clone());
        let address = mutator.allocate(5).await.unwrap();
        mutator.rollback().await.unwrap();

        let reader = Mutator::new(bouquet.clone());
        assert!(reader.read(address).await.unwrap().is_none());
        assert!(!bouquet.is_static_address(address));
    }

    #[tokio::test]
    async fn write_supersedes_the_previous_block() {
        let (bouquet, _dir) = bouquet();
        let mut mutator = Mutator::new(bouquet.clone());
        let address = mutator.allocate(2).await.unwrap();
        mutator.write(address, b"v1").await.unwrap();
        mutator.commit().await.unwrap();

        let mut mutator = Mutator::new(bouquet.clone());
        mutator.write(address, b"version-two").await.unwrap();
        mutator.commit().await.unwrap();

        let reader = Mutator::new(bouquet);
        assert_eq!(reader.read(address).await.unwrap().unwrap(), b"version-two");
    }

    #[tokio::test]
    async fn free_makes_a_committed_address_unreadable() {
        let (bouquet, _dir) = bouquet();
        let mut mutator = Mutator::new(bouquet.clone());
        let address = mutator.allocate(2).await.unwrap();
        mutator.write(address, b"v1").await.unwrap();
        mutator.commit().await.unwrap();

        let mut mutator = Mutator::new(bouquet.clone());
        mutator.free(address).await.unwrap();
        mutator.commit().await.unwrap();

        let reader = Mutator::new(bouquet);
        assert!(reader.read(address).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn free_of_a_static_address_is_rejected() {
        let (bouquet, _dir) = bouquet();
        let mut mutator = Mutator::new(bouquet.clone());
        let address = mutator.allocate(4).await.unwrap();
        mutator.write(address, b"root").await.unwrap();
        mutator.commit().await.unwrap();
        bouquet.header.lock().static_blocks.insert("root".to_string(), address);

        let mut mutator = Mutator::new(bouquet);
        let err = mutator.free(address).await.unwrap_err();
        assert!(matches!(err, PackError::FreedStaticAddress { .. }));
    }

    #[tokio::test]
    async fn temporary_allocation_is_bound_in_the_temporary_pool() {
        let (bouquet, _dir) = bouquet();
        let mut mutator = Mutator::new(bouquet.clone());
        let address = mutator.temporary(7).await.unwrap();
        mutator.write(address, b"scratch").await.unwrap();
        mutator.commit().await.unwrap();

        let bound = bouquet.temporary.bound_addresses().unwrap();
        assert!(bound.iter().any(|&(_, block)| block == address));
    }
}
