//! Pack: the top-level public handle for one open pack file (SPEC_FULL.md §6).
//!
//! Grounded on the teacher's `RsKv` struct (`rskv.rs`) — a thin public facade
//! owning the engine's services and handing out per-call request contexts —
//! generalized from typed upsert/read/rmw/delete contexts to untyped
//! allocate/write/free/read through a [`crate::mutator::Mutator`].

use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock as AsyncRwLock;

use crate::address_boundary::AddressBoundary;
use crate::address_locker::AddressLocker;
use crate::address_page_pool::AddressPagePool;
use crate::background::{BackgroundTaskManager, BackgroundTaskStats};
use crate::bouquet::{Bouquet, JournalSlots};
use crate::by_remaining::ByRemainingTable;
use crate::common::{Address, PackError, Result};
use crate::header::Header;
use crate::interim_pool::InterimPagePool;
use crate::lookup_page::LookupPagePool;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::mutator::Mutator;
use crate::options::Options;
use crate::recovery;
use crate::sheaf::Sheaf;
use crate::temporary_pool::TemporaryPool;
use crate::vacuum::{self, BestFitStrategy, VacuumStats};
use crate::vacuum_tracker::VacuumTracker;

/// A single open pack file and every service needed to transact against it.
pub struct Pack {
    bouquet: Arc<Bouquet>,
    background: BackgroundTaskManager,
    operation_lock: Arc<AsyncRwLock<()>>,
}

impl Pack {
    /// Open `path`, creating a fresh file with `options`' geometry if it does
    /// not exist, or reopening and running recovery against it if it does.
    ///
    /// On reopen, `options.page_size` must match the geometry the file was
    /// created with; any other mismatched persisted field is also rejected
    /// rather than silently overridden, since the on-disk layout already
    /// committed to it.
    pub async fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        options.validate()?;
        let sheaf = Arc::new(Sheaf::open(path, options.page_size)?);
        let existing = sheaf.len()? > 0;

        let header = if existing {
            let header = Header::load(&sheaf)?;
            ensure_geometry_matches(&header, &options)?;
            header
        } else {
            let header = Header::fresh(&options);
            header.save(&sheaf)?;
            header
        };

        let interim_start = if existing {
            sheaf.len()?
        } else {
            header.address_boundary + options.page_size as u64
        };

        let boundary = Arc::new(AddressBoundary::new(sheaf.clone(), header.address_boundary));
        let interim = Arc::new(InterimPagePool::new(sheaf.clone(), interim_start));
        let lookup = Arc::new(LookupPagePool::new(sheaf.clone(), interim.clone(), options.lookup_block_sizes.clone()));

        let (by_remaining, by_remaining_position) = if header.by_remaining_table == 0 {
            let position = interim.allocate()?;
            (
                Arc::new(ByRemainingTable::create(sheaf.clone(), lookup.clone(), position, options.alignment)?),
                position,
            )
        } else {
            (
                Arc::new(ByRemainingTable::open(sheaf.clone(), lookup.clone(), header.by_remaining_table)?),
                header.by_remaining_table,
            )
        };

        let address_pages = Arc::new(AddressPagePool::new(sheaf.clone(), boundary.clone()));
        let locker = Arc::new(AddressLocker::new(options.address_locker_buckets));
        let temporary = Arc::new(TemporaryPool::new(sheaf.clone(), interim.clone(), header.first_temporary_node));
        let journal_slots = Arc::new(JournalSlots::new(header.journal_starts.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let vacuum_tracker = Arc::new(VacuumTracker::new());

        let mut header = header;
        header.by_remaining_table = by_remaining_position;

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
            options: options.clone(),
            header: parking_lot::Mutex::new(header),
        });
        bouquet.persist_header(false)?;

        recovery::recover(&bouquet)?;

        let operation_lock = Arc::new(AsyncRwLock::new(()));
        let background = BackgroundTaskManager::new(options.vacuum_interval_ms, bouquet.clone(), operation_lock.clone());
        background.start()?;

        Ok(Self {
            bouquet,
            background,
            operation_lock,
        })
    }

    /// Begin a new transaction. Nothing it does is visible until `commit`
    /// returns.
    pub fn mutate(&self) -> Mutator {
        Mutator::new(self.bouquet.clone())
    }

    /// Resolve a named static block installed at creation time.
    pub fn static_block(&self, uri: &str) -> Result<Address> {
        self.bouquet.static_block(uri)
    }

    /// Run one vacuum pass, serialized against the background vacuum task by
    /// `operation_lock` in addition to `Bouquet::vacuum_mutex`.
    pub async fn vacuum(&self) -> Result<VacuumStats> {
        let _lock = self.operation_lock.write().await;
        vacuum::run(&self.bouquet, &BestFitStrategy)
    }

    /// Force every durable write made so far to stable storage, without
    /// waiting for a commit.
    pub async fn force(&self) -> Result<()> {
        self.bouquet.sheaf.flush_and_force()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.bouquet
            .metrics
            .snapshot(self.bouquet.boundary.boundary(), self.bouquet.locker.held_count())
    }

    pub fn background_stats(&self) -> BackgroundTaskStats {
        self.background.get_stats()
    }

    /// Stop background maintenance and persist a clean-shutdown header.
    /// After this returns, the pack file can be reopened without its next
    /// recovery pass needing to replay any journal.
    pub async fn close(self) -> Result<()> {
        self.background.stop().await?;
        self.bouquet.persist_header(true)?;
        self.bouquet.sheaf.close()
    }
}

fn ensure_geometry_matches(header: &Header, options: &Options) -> Result<()> {
    if header.page_size != options.page_size {
        return Err(PackError::InvalidConfig {
            message: format!(
                "file was created with page_size {}, but options specify {}",
                header.page_size, options.page_size
            ),
        });
    }
    if header.alignment != options.alignment {
        return Err(PackError::InvalidConfig {
            message: format!(
                "file was created with alignment {}, but options specify {}",
                header.alignment, options.alignment
            ),
        });
    }
    if header.journal_count != options.journal_count {
        return Err(PackError::InvalidConfig {
            message: format!(
                "file was created with journal_count {}, but options specify {}",
                header.journal_count, options.journal_count
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_options() -> Options {
        let mut opts = Options::low_memory().unwrap();
        opts.vacuum_interval_ms = None;
        opts
    }

    #[tokio::test]
    async fn open_creates_a_fresh_file_and_round_trips_an_allocation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.pack");
        let pack = Pack::open(&path, test_options()).await.unwrap();

        let mut mutator = pack.mutate();
        let address = mutator.allocate(5).await.unwrap();
        mutator.write(address, b"hello").await.unwrap();
        mutator.commit().await.unwrap();

        let reader = pack.mutate();
        assert_eq!(reader.read(address).await.unwrap().unwrap(), b"hello");
        pack.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopening_after_a_clean_close_preserves_committed_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.pack");

        let pack = Pack::open(&path, test_options()).await.unwrap();
        let mut mutator = pack.mutate();
        let address = mutator.allocate(7).await.unwrap();
        mutator.write(address, b"durable").await.unwrap();
        mutator.commit().await.unwrap();
        pack.close().await.unwrap();

        let pack = Pack::open(&path, test_options()).await.unwrap();
        let reader = pack.mutate();
        assert_eq!(reader.read(address).await.unwrap().unwrap(), b"durable");
        pack.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopening_with_mismatched_page_size_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.pack");
        let pack = Pack::open(&path, test_options()).await.unwrap();
        pack.close().await.unwrap();

        let mut mismatched = test_options();
        mismatched.page_size = 8192;
        let err = Pack::open(&path, mismatched).await.unwrap_err();
        assert!(matches!(err, PackError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn vacuum_through_pack_reclaims_freed_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.pack");
        let pack = Pack::open(&path, test_options()).await.unwrap();

        let mut mutator = pack.mutate();
        let a = mutator.allocate(3).await.unwrap();
        mutator.write(a, b"one").await.unwrap();
        let b = mutator.allocate(3).await.unwrap();
        mutator.write(b, b"two").await.unwrap();
        mutator.commit().await.unwrap();

        let mut mutator = pack.mutate();
        mutator.free(a).await.unwrap();
        mutator.free(b).await.unwrap();
        mutator.commit().await.unwrap();

        let stats = pack.vacuum().await.unwrap();
        assert!(stats.pages_released >= 1);
        pack.close().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_reflect_committed_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.pack");
        let pack = Pack::open(&path, test_options()).await.unwrap();

        let mut mutator = pack.mutate();
        let address = mutator.allocate(3).await.unwrap();
        mutator.write(address, b"one").await.unwrap();
        mutator.commit().await.unwrap();

        let snapshot = pack.metrics();
        assert_eq!(snapshot.allocations_total, 1);
        assert_eq!(snapshot.commits_total, 1);
        pack.close().await.unwrap();
    }
}
