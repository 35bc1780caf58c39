//! The address boundary: the monotonically growing line separating the
//! address region from the user region, and the page-move lock that guards
//! crossing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::address_page::AddressPage;
use crate::common::{Position, Result};
use crate::sheaf::Sheaf;

/// Guards promotion of user pages into address pages. Held in read mode by
/// every operation that dereferences an on-disk position; in write mode
/// only while promoting a page (see SPEC_FULL.md §5).
pub struct AddressBoundary {
    sheaf: Arc<Sheaf>,
    lock: RwLock<()>,
    boundary: AtomicU64,
}

impl AddressBoundary {
    pub fn new(sheaf: Arc<Sheaf>, initial: Position) -> Self {
        Self {
            sheaf,
            lock: RwLock::new(()),
            boundary: AtomicU64::new(initial),
        }
    }

    pub fn boundary(&self) -> Position {
        self.boundary.load(Ordering::Acquire)
    }

    /// Acquire the page-move lock in read mode for the duration of a
    /// dereference.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Resolve any stored position to its current location, following the
    /// forward reference left behind by page promotion as many times as
    /// necessary. Preserves an intra-page offset so it is safe to call on
    /// byte-precise cursors (e.g. a journal position), not just page starts.
    pub fn adjust(&self, position: Position) -> Result<Position> {
        let page_size = self.sheaf.page_size() as u64;
        let _guard = self.lock.read();
        let mut position = position;
        loop {
            let boundary = self.boundary();
            if position >= boundary {
                return Ok(position);
            }
            let offset = position % page_size;
            let page_start = position - offset;
            let page = AddressPage::new(&self.sheaf, page_start, 1);
            let moved_to = page.forward_reference()?;
            position = moved_to + offset;
        }
    }

    /// Apply (or, on replay, re-confirm) the promotion of the page currently
    /// at the boundary to position `to`. Idempotent: once the boundary has
    /// advanced past `from`, a repeated call is a no-op, which is what makes
    /// `MOVE_PAGE`/`CREATE_ADDRESS_PAGE` safe to replay after a crash.
    pub fn apply_promotion(&self, from: Position, to: Position) -> Result<()> {
        let guard = self.lock.write();
        self.apply_promotion_locked(&guard, from, to)
    }

    /// Core of [`Self::apply_promotion`], taking an already-held write guard
    /// so a caller that must keep the lock held across more than the
    /// promotion itself (see [`Self::promote_and_hold`]) doesn't have to
    /// re-enter a non-reentrant lock.
    fn apply_promotion_locked(
        &self,
        _guard: &parking_lot::RwLockWriteGuard<'_, ()>,
        from: Position,
        to: Position,
    ) -> Result<()> {
        let boundary = self.boundary();
        if from < boundary {
            return Ok(());
        }
        debug_assert_eq!(from, boundary, "promotion must happen at the current boundary");

        let bytes = self.sheaf.read_page(from)?;
        self.sheaf
            .with_page_mut(to, |buf| buf.copy_from_slice(&bytes))?;

        let page = AddressPage::new(&self.sheaf, from, 1);
        page.initialize()?;
        page.set_forward_reference(to)?;

        let page_size = self.sheaf.page_size() as u64;
        self.boundary.store(from + page_size, Ordering::Release);
        log::debug!("promoted user page {from} to address page, content moved to {to}");
        Ok(())
    }

    /// Promote `from` to `to`, then run `f` (a journal flush plus the
    /// remaining replay of this same maintenance journal) while still
    /// holding the write lock, so no concurrent dereference can observe the
    /// boundary having advanced before the promotion's effects are durable
    /// (SPEC_FULL.md §9 "Cyclic graphs and back-references", Open Question).
    ///
    /// The journal replayed by `f` contains a `CreateAddressPage` record for
    /// this same promotion; its handler checks `boundary() <= position`
    /// (a lock-free atomic read) before calling `apply_promotion`, so it
    /// short-circuits here instead of trying to re-acquire this lock.
    pub fn promote_and_hold<F>(&self, from: Position, to: Position, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let guard = self.lock.write();
        self.apply_promotion_locked(&guard, from, to)?;
        f()
    }
}
