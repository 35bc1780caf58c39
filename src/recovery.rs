//! Crash recovery, run once at open before a [`crate::pack::Pack`] accepts
//! any mutator (SPEC_FULL.md §6 "Recovery").
//!
//! Two independent concerns live here: replaying whatever journals a hard
//! shutdown left in flight, and sweeping the temporary pool for blocks that
//! were allocated but never explicitly freed or bound permanently. The
//! temporary sweep always runs, even after a clean shutdown — see
//! DESIGN.md's accepted Open Question decision on why a soft shutdown does
//! not exempt it.
//!
//! Grounded on the teacher's `core/recovery.rs` top-level recovery entry
//! point shape, generalized from hybrid-log page-range replay to this
//! engine's journal-slot replay plus temporary-pool sweep.

use std::sync::Arc;

use crate::bouquet::Bouquet;
use crate::common::{Result, FREE_SLOT, RESERVED_SLOT};
use crate::journal::{JournalWriter, Operation};

/// Run recovery against a freshly constructed [`Bouquet`]. Must be called
/// before any [`crate::mutator::Mutator`] is handed out.
pub fn recover(bouquet: &Arc<Bouquet>) -> Result<()> {
    let was_soft = bouquet.header.lock().shutdown_soft;
    if !was_soft {
        replay_incomplete_journals(bouquet)?;
    }
    sweep_temporary_nodes(bouquet)?;
    bouquet.persist_header(true)?;
    Ok(())
}

fn replay_incomplete_journals(bouquet: &Arc<Bouquet>) -> Result<()> {
    let starts = bouquet.journal_slots.snapshot();
    for (slot, start) in starts.into_iter().enumerate() {
        if start == FREE_SLOT || start == RESERVED_SLOT {
            continue;
        }
        log::warn!("recovery: replaying incomplete journal in slot {slot} at position {start}");
        bouquet.player().replay(start)?;
        bouquet.journal_slots.release(slot);
    }
    Ok(())
}

/// Free every block address still bound by a temporary-pool node. A node
/// left bound at open time names a block whose owning process exited
/// (cleanly or not) without freeing or otherwise disposing of it.
///
/// The frees are journaled and replayed through the same player a mutator's
/// commit uses, so this sweep is itself crash-safe: if the process dies
/// mid-sweep, the next open's sweep picks up wherever the journal's replay
/// left off, since `bound_addresses` only reports nodes not yet tombstoned.
fn sweep_temporary_nodes(bouquet: &Arc<Bouquet>) -> Result<()> {
    let bound = bouquet.temporary.bound_addresses()?;
    if bound.is_empty() {
        return Ok(());
    }

    let mut writer = JournalWriter::new(bouquet.sheaf.clone(), bouquet.interim.clone())?;
    for &(_, block) in &bound {
        writer.append(Operation::Free { address: block })?;
    }
    writer.append(Operation::Commit)?;
    writer.append(Operation::Terminate)?;
    let journal_pages = writer.pages().to_vec();
    let bytes_written = writer.bytes_written();
    let start = writer.finish()?;

    bouquet.sheaf.flush_and_force()?;
    let slot = bouquet.journal_slots.acquire()?;
    bouquet.journal_slots.set(slot, start);
    bouquet.persist_header(false)?;

    bouquet.player().replay(start)?;

    bouquet.journal_slots.release(slot);
    bouquet.persist_header(false)?;

    for page in journal_pages {
        bouquet.interim.release(page)?;
    }
    bouquet.metrics.record_journal_bytes_written(bytes_written);

    for &(node, _) in &bound {
        bouquet.temporary.tombstone(node)?;
    }

    log::info!("recovery: freed {} abandoned temporary block(s)", bound.len());
    Ok(())
}
