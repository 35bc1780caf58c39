//! Vacuum: the compaction pass that reclaims space fragmented by `free()`
//! and merges sparsely-filled user block pages, driven by the pages the
//! player's `FREE` replay has marked in the [`crate::vacuum_tracker`]
//! (SPEC_FULL.md §4.10).
//!
//! The move-planning strategy is pluggable behind [`VacuumStrategy`]; it
//! only ever *records* `(from, to, truncate_at)` triples through a
//! [`MoveRecorder`] and never touches a page itself — applying those moves
//! is entirely the player's job, the same `MOVE` operation handler a crash
//! recovery replay uses. This keeps vacuum's on-disk effects exactly as
//! restartable as a commit's.
//!
//! Grounded on `gc.rs`'s orchestration shape (`should_run`/stats struct/
//! async entry point), adapted from log-segment reclamation to best-fit
//! block-page merging.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block_page::{BlockPage, HEADER_LEN as BLOCK_PAGE_HEADER_LEN};
use crate::bouquet::Bouquet;
use crate::common::{Address, Position, Result};
use crate::journal::{JournalWriter, Operation};

/// One planned page-to-page consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedMove {
    pub from: Position,
    pub to: Position,
    pub truncate_at: Address,
}

/// Sink a [`VacuumStrategy`] records its planned moves into, kept abstract
/// so a strategy never has to know how those moves end up applied
/// (SPEC_FULL.md §4.4 "receives an abstract MoveRecorder").
pub trait MoveRecorder {
    fn record(&mut self, from: Position, to: Position, truncate_at: Address);
}

#[derive(Default)]
struct VecRecorder(Vec<PlannedMove>);

impl MoveRecorder for VecRecorder {
    fn record(&mut self, from: Position, to: Position, truncate_at: Address) {
        self.0.push(PlannedMove { from, to, truncate_at });
    }
}

/// A pluggable move-planning strategy. Given the set of non-empty pages
/// that had a block freed since the last vacuum, decide where each one's
/// remaining live content should be consolidated.
pub trait VacuumStrategy: Send + Sync {
    fn plan(&self, bouquet: &Bouquet, freed: &[Position], recorder: &mut dyn MoveRecorder) -> Result<()>;
}

/// Default strategy (SPEC_FULL.md §4.4): for each freed page, find the
/// smallest by-remaining bucket with enough free space to take its live
/// content; fall back to a freshly allocated empty page when nothing fits,
/// and keep merging later freed pages into that same fresh page as long as
/// it still has room.
pub struct BestFitStrategy;

impl VacuumStrategy for BestFitStrategy {
    fn plan(&self, bouquet: &Bouquet, freed: &[Position], recorder: &mut dyn MoveRecorder) -> Result<()> {
        let page_size = bouquet.sheaf.page_size();
        // Destinations touched by this planning pass, in the order they
        // were first used, each with the free space it has left after
        // every move planned into it so far.
        let mut destinations: Vec<(Position, u32)> = Vec::new();
        let mut predicted_last: HashMap<Position, Address> = HashMap::new();

        for &from in freed {
            let src = BlockPage::new(&bouquet.sheaf, from, true);
            let live_bytes = page_size - src.remaining()?;
            if live_bytes == 0 {
                continue;
            }

            let to = if let Some(slot) = destinations.iter_mut().find(|(pos, rem)| *pos != from && *rem >= live_bytes) {
                let (to, rem) = slot;
                *rem -= live_bytes;
                *to
            } else {
                match bouquet.by_remaining.best_fit(live_bytes)? {
                    Some(candidate) if candidate != from => {
                        let existing_remaining = BlockPage::new(&bouquet.sheaf, candidate, true).remaining()?;
                        destinations.push((candidate, existing_remaining - live_bytes));
                        candidate
                    }
                    Some(candidate) => {
                        // Picked ourselves as our own destination: put it
                        // back (it is still a legitimate destination for a
                        // *different* freed page) and fall through to a
                        // fresh allocation for this one.
                        let remaining = BlockPage::new(&bouquet.sheaf, candidate, true).remaining()?;
                        bouquet.by_remaining.track(candidate, remaining)?;
                        let to = bouquet.interim.allocate_fresh()?;
                        BlockPage::new(&bouquet.sheaf, to, true).initialize()?;
                        destinations.push((to, page_size - BLOCK_PAGE_HEADER_LEN as u32 - live_bytes));
                        to
                    }
                    None => {
                        let to = bouquet.interim.allocate_fresh()?;
                        BlockPage::new(&bouquet.sheaf, to, true).initialize()?;
                        destinations.push((to, page_size - BLOCK_PAGE_HEADER_LEN as u32 - live_bytes));
                        to
                    }
                }
            };

            let truncate_at = match predicted_last.get(&to) {
                Some(&addr) => addr,
                None => BlockPage::new(&bouquet.sheaf, to, true).last_address()?,
            };
            recorder.record(from, to, truncate_at);
            predicted_last.insert(to, src.last_address()?);
        }
        Ok(())
    }
}

fn is_now_empty(remaining: u32, page_size: u32) -> bool {
    remaining == page_size - BLOCK_PAGE_HEADER_LEN as u32
}

/// Outcome of one `Vacuum::run` call, fed into
/// [`crate::metrics::MetricsCollector::record_vacuum_run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VacuumStats {
    pub pages_examined: usize,
    pub moves_planned: usize,
    pub pages_released: usize,
    pub bytes_reclaimed: u64,
}

/// Run one vacuum pass: purge tombstones from every page the player has
/// marked freed since the last run, plan consolidating moves for what's
/// left, journal and replay those moves, and return fully-evacuated pages
/// to the interim pool.
///
/// Serialized by `bouquet.vacuum_mutex` so only one vacuum run plans
/// against the by-remaining table at a time (SPEC_FULL.md §4.10, §5).
pub fn run(bouquet: &Arc<Bouquet>, strategy: &dyn VacuumStrategy) -> Result<VacuumStats> {
    let _guard = bouquet.vacuum_mutex.lock();
    let freed = bouquet.vacuum_tracker.drain();
    let mut stats = VacuumStats {
        pages_examined: freed.len(),
        ..Default::default()
    };
    if freed.is_empty() {
        return Ok(stats);
    }

    let page_size = bouquet.sheaf.page_size();
    let mut candidates = Vec::new();
    let mut empties = Vec::new();
    let mut reclaimed = 0u64;

    for position in freed {
        let page = BlockPage::new(&bouquet.sheaf, position, true);
        let old_remaining = page.remaining()?;
        bouquet.by_remaining.untrack(position, old_remaining)?;
        let new_remaining = page.purge()?;
        reclaimed += (new_remaining - old_remaining) as u64;
        if is_now_empty(new_remaining, page_size) {
            empties.push(position);
        } else {
            bouquet.by_remaining.track(position, new_remaining)?;
            candidates.push(position);
        }
    }

    let mut recorder = VecRecorder::default();
    strategy.plan(bouquet, &candidates, &mut recorder)?;
    stats.moves_planned = recorder.0.len();

    if !recorder.0.is_empty() {
        let mut writer = JournalWriter::new(bouquet.sheaf.clone(), bouquet.interim.clone())?;
        for mv in &recorder.0 {
            writer.append(Operation::Move {
                from: mv.from,
                to: mv.to,
                truncate_at: mv.truncate_at,
            })?;
            // A consolidated-away source's own entry (it was still tracked,
            // being non-empty) must not outlive the move: the player will
            // never re-track it, and it is about to be released wholesale.
            let remaining = BlockPage::new(&bouquet.sheaf, mv.from, true).remaining()?;
            bouquet.by_remaining.untrack(mv.from, remaining)?;
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

        for mv in &recorder.0 {
            bouquet.interim.release(mv.from)?;
            reclaimed += page_size as u64;
        }
        stats.pages_released += recorder.0.len();
    }

    for position in empties {
        bouquet.interim.release(position)?;
        reclaimed += page_size as u64;
        stats.pages_released += 1;
    }

    stats.bytes_reclaimed = reclaimed;
    bouquet.metrics.record_vacuum_run(stats.bytes_reclaimed);
    log::info!(
        "vacuum: examined {} page(s), planned {} move(s), released {} page(s), reclaimed {} byte(s)",
        stats.pages_examined,
        stats.moves_planned,
        stats.pages_released,
        stats.bytes_reclaimed
    );
    Ok(stats)
}
