//! The bouquet: the bundle of process-wide services one open pack file
//! needs, threaded explicitly through the API as `Arc`s rather than held in
//! a global singleton, so a process can open more than one [`crate::pack::Pack`]
//! at a time (SPEC_FULL.md §9 "Global state").

use std::sync::Arc;

use parking_lot::Mutex;

use crate::address_boundary::AddressBoundary;
use crate::address_locker::AddressLocker;
use crate::address_page_pool::AddressPagePool;
use crate::by_remaining::ByRemainingTable;
use crate::common::{Address, PackError, Position, Result};
use crate::header::Header;
use crate::interim_pool::InterimPagePool;
use crate::journal::{JournalWriter, Operation};
use crate::lookup_page::LookupPagePool;
use crate::metrics::MetricsCollector;
use crate::options::Options;
use crate::player::Player;
use crate::sheaf::Sheaf;
use crate::temporary_pool::TemporaryPool;
use crate::vacuum_tracker::VacuumTracker;

/// Tracks which of the header's fixed `journal_count` slots are idle (value
/// 0) versus owned by an in-flight mutator or maintenance transaction.
pub struct JournalSlots {
    starts: Mutex<Vec<Position>>,
}

impl JournalSlots {
    pub fn new(starts: Vec<Position>) -> Self {
        Self {
            starts: Mutex::new(starts),
        }
    }

    /// Claim an idle slot, marking it `RESERVED` (u64::MAX) until the
    /// caller's journal is written and its real start position recorded.
    pub fn acquire(&self) -> Result<usize> {
        let mut starts = self.starts.lock();
        let slot = starts
            .iter()
            .position(|&s| s == 0)
            .ok_or(PackError::AddressPoolExhausted)?;
        starts[slot] = u64::MAX;
        Ok(slot)
    }

    pub fn set(&self, slot: usize, start: Position) {
        self.starts.lock()[slot] = start;
    }

    pub fn release(&self, slot: usize) {
        self.starts.lock()[slot] = 0;
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.starts.lock().clone()
    }
}

/// The process-wide services backing one open pack file.
pub struct Bouquet {
    pub sheaf: Arc<Sheaf>,
    pub boundary: Arc<AddressBoundary>,
    pub interim: Arc<InterimPagePool>,
    pub lookup: Arc<LookupPagePool>,
    pub by_remaining: Arc<ByRemainingTable>,
    pub address_pages: Arc<AddressPagePool>,
    pub locker: Arc<AddressLocker>,
    pub temporary: Arc<TemporaryPool>,
    pub journal_slots: Arc<JournalSlots>,
    pub metrics: Arc<MetricsCollector>,
    pub vacuum_tracker: Arc<VacuumTracker>,
    /// Serializes vacuum runs against each other. Sits below the page-move
    /// lock and above per-page monitors in the lock hierarchy
    /// (SPEC_FULL.md §5).
    pub vacuum_mutex: Mutex<()>,
    pub options: Options,
    /// The file header, kept in memory and reconciled with live geometry on
    /// every [`Self::persist_header`] call. The static block map is fixed at
    /// creation time and never mutated after.
    pub header: Mutex<Header>,
}

impl Bouquet {
    /// Addresses installed in the static block map, which `Mutator::free`
    /// refuses to free (SPEC_FULL.md §7 `FREED_STATIC_ADDRESS`).
    pub fn static_block(&self, uri: &str) -> Result<Address> {
        self.header.lock().static_block(uri)
    }

    pub fn is_static_address(&self, address: Address) -> bool {
        self.header.lock().static_blocks.values().any(|&a| a == address)
    }

    /// Reconcile the header's geometry fields with current live state and
    /// write it through the sheaf, which fsyncs as part of `Header::save`.
    /// `shutdown_soft` should be `false` for any header write made while a
    /// journal slot is non-zero, and `true` only at `Pack::close`.
    pub fn persist_header(&self, shutdown_soft: bool) -> Result<()> {
        let mut header = self.header.lock();
        header.shutdown_soft = shutdown_soft;
        header.address_boundary = self.boundary.boundary();
        header.first_temporary_node = self.temporary.head();
        header.by_remaining_table = self.by_remaining.position();
        header.journal_starts = self.journal_slots.snapshot();
        header.save(&self.sheaf)
    }

    pub fn player(&self) -> Player {
        Player::new(
            self.sheaf.clone(),
            self.boundary.clone(),
            self.by_remaining.clone(),
            self.locker.clone(),
            self.temporary.clone(),
            self.vacuum_tracker.clone(),
        )
    }

    /// Promote the user page currently sitting at the address boundary into
    /// a fresh address page, journaling the move so it survives a crash
    /// between the two steps. Called opportunistically when the
    /// address-page pool runs low.
    ///
    /// This maintenance journal is written and replayed synchronously
    /// rather than occupying one of the header's persistent journal slots;
    /// see DESIGN.md for the accepted recovery-window simplification this
    /// implies. The destination page is leased with `allocate_fresh` rather
    /// than `allocate`, which matters: see `InterimPagePool::allocate_fresh`.
    pub fn grow_address_region(&self) -> Result<()> {
        let from = self.boundary.boundary();
        let to = self.interim.allocate_fresh()?;

        let mut writer = JournalWriter::new(self.sheaf.clone(), self.interim.clone())?;
        writer.append(Operation::MovePage { from, to })?;
        writer.append(Operation::CreateAddressPage { position: from, moved_to: to })?;
        writer.append(Operation::Commit)?;
        writer.append(Operation::Terminate)?;
        let pages = writer.pages().to_vec();
        let bytes_written = writer.bytes_written();
        let start = writer.finish()?;

        // Hold the page-move write lock across the flush and the replay of
        // this same journal, not just the promotion itself: otherwise a
        // concurrent reader could dereference an address through the
        // newly-promoted page before its content is durable at `to`.
        self.boundary.promote_and_hold(from, to, || {
            self.sheaf.flush_and_force()?;
            self.player().replay(start)?;
            Ok(())
        })?;

        for page in pages {
            self.interim.release(page)?;
        }
        self.address_pages.admit(from)?;
        self.metrics.record_journal_bytes_written(bytes_written);
        self.metrics.record_address_region_growth();
        log::info!("grew address region: promoted page {from} -> {to}");
        Ok(())
    }

    /// Ensure at least one address page has a free slot, growing the
    /// address region if the pool has run dry.
    pub fn ensure_address_capacity(&self) -> Result<()> {
        if self.address_pages.free_slot_count()? < self.options.address_page_pool_size as usize {
            self.grow_address_region()?;
        }
        Ok(())
    }
}
