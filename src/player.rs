//! Player: replays a journal's operations, idempotently.
//!
//! Driven by a journal start position (from the header's per-journal slot,
//! or a position a mutator just finished writing to). The same code path
//! replays a live commit and a crash-recovery tail: both are "some prefix
//! of this journal may already have taken effect," which is why every
//! operation handler re-checks on-disk state before mutating it rather than
//! assuming a clean start (SPEC_FULL.md §4.7).

use std::sync::Arc;

use crate::address_boundary::AddressBoundary;
use crate::address_locker::{AddressLatch, AddressLocker};
use crate::address_page::AddressPage;
use crate::block_page::BlockPage;
use crate::by_remaining::ByRemainingTable;
use crate::common::{Address, FREE_SLOT, Position, RESERVED_SLOT, Result};
use crate::journal::{JournalPage, Operation, PAGE_HEADER_LEN};
use crate::sheaf::Sheaf;
use crate::temporary_pool::TemporaryPool;
use crate::vacuum_tracker::VacuumTracker;

/// What a replay pass accomplished, for the caller to persist.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOutcome {
    /// The value the journal's header slot should be set to: the position
    /// of the last unreplayed `CHECKPOINT`, or 0 once a `COMMIT` has run.
    pub journal_start: Position,
}

pub struct Player {
    sheaf: Arc<Sheaf>,
    boundary: Arc<AddressBoundary>,
    by_remaining: Arc<ByRemainingTable>,
    locker: Arc<AddressLocker>,
    temporary: Arc<TemporaryPool>,
    vacuum_tracker: Arc<VacuumTracker>,
}

impl Player {
    pub fn new(
        sheaf: Arc<Sheaf>,
        boundary: Arc<AddressBoundary>,
        by_remaining: Arc<ByRemainingTable>,
        locker: Arc<AddressLocker>,
        temporary: Arc<TemporaryPool>,
        vacuum_tracker: Arc<VacuumTracker>,
    ) -> Self {
        Self {
            sheaf,
            boundary,
            by_remaining,
            locker,
            temporary,
            vacuum_tracker,
        }
    }

    fn address_page_for(&self, address: Address) -> AddressPage<'_> {
        let page_size = self.sheaf.page_size() as u64;
        let page_start = address - (address % page_size);
        // Address pages exist only as the product of promoting a user page
        // (SPEC_FULL.md §4.1); slot 0 is always the forward reference.
        AddressPage::new(&self.sheaf, page_start, 1)
    }

    /// Replay every operation starting at `start`, following `NextOperation`
    /// chains, until `Terminate`. Returns the journal-start value the
    /// caller should persist into the header.
    pub fn replay(&self, start: Position) -> Result<ReplayOutcome> {
        let mut held_latches: Vec<AddressLatch<'_>> = Vec::new();
        let mut journal_start = start;
        let mut page = start;
        let mut offset = PAGE_HEADER_LEN;
        let mut page_verified = false;

        loop {
            let journal_page = JournalPage::new(&self.sheaf, page);
            if !page_verified {
                // A checksum mismatch marks a page that was never fully
                // flushed before a crash; treat it as the journal's own end
                // rather than an error, discarding the torn tail
                // (SPEC_FULL.md §7, §9 Open Question 3).
                if !journal_page.verify()? {
                    return Ok(ReplayOutcome { journal_start });
                }
                page_verified = true;
            }
            let op = journal_page.read_operation(offset)?;
            offset += op.encoded_len();

            match op {
                Operation::NextOperation { next } => {
                    page = next;
                    offset = PAGE_HEADER_LEN;
                    page_verified = false;
                }
                Operation::MovePage { .. } => {
                    // The actual copy and reinitialization both happen in
                    // `CreateAddressPage`'s handler (AddressBoundary::apply_promotion
                    // performs both steps atomically); this record exists for
                    // journal readability and future tooling, not replay.
                }
                Operation::CreateAddressPage { position, moved_to } => {
                    // A lock-free pre-check: when this replay is itself
                    // running inside `AddressBoundary::promote_and_hold`
                    // (address-region growth holding the write lock across
                    // its own replay), the promotion already happened and
                    // `boundary()` already reflects it, so skip straight
                    // past `apply_promotion` instead of trying to re-acquire
                    // a write lock this thread already holds.
                    if self.boundary.boundary() <= position {
                        self.boundary.apply_promotion(position, moved_to)?;
                    }
                }
                Operation::Write { address, interim_pos } => {
                    self.replay_write(address, interim_pos)?;
                }
                Operation::Free { address } => {
                    let latch = self.locker.latch(address);
                    self.replay_free(address)?;
                    held_latches.push(latch);
                }
                Operation::Temporary { address, temp_node } => {
                    self.temporary.bind(temp_node, address)?;
                }
                Operation::Move { from, to, truncate_at } => {
                    self.replay_move(from, to, truncate_at)?;
                }
                Operation::Checkpoint { new_start } => {
                    self.sheaf.flush_dirty()?;
                    self.sheaf.force()?;
                    journal_start = new_start;
                }
                Operation::Commit => {
                    self.sheaf.flush_dirty()?;
                    self.sheaf.force()?;
                    journal_start = 0;
                    // The latch-release window for any FREE in this journal
                    // ends exactly here: once COMMIT is durable, a
                    // reallocation racing the free can no longer land
                    // between the free's effect and a crash that would
                    // leave it ambiguous.
                    held_latches.clear();
                }
                Operation::Terminate => {
                    return Ok(ReplayOutcome { journal_start });
                }
            }
        }
    }

    /// Re-read `address`'s slot until the same value is observed twice in a
    /// row (SPEC_FULL.md §4.7's "two-pass previous position check"): a
    /// vacuum mover racing this replay repoints the slot mid-flight, and a
    /// single read could land on the stale value just before it changes.
    fn stable_raw(&self, page: &AddressPage<'_>, address: Address) -> Result<u64> {
        let mut current = page.raw(address)?;
        loop {
            let observed = page.raw(address)?;
            if observed == current {
                return Ok(current);
            }
            current = observed;
        }
    }

    fn replay_write(&self, address: Address, interim_pos: Position) -> Result<()> {
        let target = self.boundary.adjust(interim_pos)?;
        // The interim page this WRITE names becomes the block's permanent,
        // addressable home in place: no separate user page is copied to
        // (SPEC_FULL.md §4.3, §4.7). Promoting it here, before the page is
        // ever opened with `is_user=true` below, keeps the on-disk
        // user-bit invariant intact.
        BlockPage::promote_interim_to_user(&self.sheaf, target)?;
        let page = self.address_page_for(address);
        let current = self.stable_raw(&page, address)?;
        if current != target {
            if current != FREE_SLOT && current != RESERVED_SLOT {
                let old_position = self.boundary.adjust(current)?;
                if old_position != target {
                    BlockPage::new(&self.sheaf, old_position, true).free(address)?;
                }
            }
            page.set(address, target)?;
        }

        // Self-correcting: remove whatever stale entry (if any) exists for
        // this page, then re-add it at its current remaining. Safe to run
        // unconditionally since `remaining()` reflects ground truth and an
        // untrack of an absent entry is a harmless no-op.
        let block = BlockPage::new(&self.sheaf, target, true);
        let remaining = block.remaining()?;
        self.by_remaining.untrack(target, remaining)?;
        self.by_remaining.track(target, remaining)?;
        Ok(())
    }

    fn replay_free(&self, address: Address) -> Result<()> {
        let page = self.address_page_for(address);
        let current = self.stable_raw(&page, address)?;
        if current == FREE_SLOT {
            return Ok(());
        }
        if current != RESERVED_SLOT {
            let position = self.boundary.adjust(current)?;
            // Tombstoning never changes a page's `remaining()` (only
            // vacuum's `purge()` reclaims that space), so no by-remaining
            // bookkeeping is needed here.
            BlockPage::new(&self.sheaf, position, true).free(address)?;
            self.vacuum_tracker.mark_freed(position);
        }
        page.free(address)?;
        Ok(())
    }

    fn replay_move(&self, from: Position, to: Position, truncate_at: Address) -> Result<()> {
        let from = self.boundary.adjust(from)?;
        let to = self.boundary.adjust(to)?;
        let src = BlockPage::new(&self.sheaf, from, true);
        let dest = BlockPage::new(&self.sheaf, to, true);

        dest.truncate_after(truncate_at)?;
        for address in src.live_addresses()? {
            src.copy(address, &dest)?;
            self.address_page_for(address).set(address, to)?;
        }

        let remaining = dest.remaining()?;
        self.by_remaining.untrack(to, remaining)?;
        self.by_remaining.track(to, remaining)?;
        Ok(())
    }
}
