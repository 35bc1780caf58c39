//! Background task management for pack
//!
//! This module implements a single interval-driven maintenance task: running
//! vacuum on whatever cadence `Options::vacuum_interval_ms` names. Trimmed
//! from the teacher's checkpoint+GC+log-maintenance trio (`BackgroundTaskManager`)
//! down to this one task, since journal durability here is per-commit rather
//! than periodic, and there is no separate read-only/head region to advance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock as AsyncRwLock;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::bouquet::Bouquet;
use crate::common::{PackError, Result};
use crate::vacuum::{self, BestFitStrategy};

/// Background task manager for automatic vacuum maintenance.
pub struct BackgroundTaskManager {
    running: Arc<AtomicBool>,
    interval_ms: Option<u64>,
    bouquet: Arc<Bouquet>,
    /// Coordinates with a manually invoked `Pack::vacuum()` so the two never
    /// race each other's planning pass (the vacuum mutex inside `Bouquet`
    /// additionally serializes the actual work).
    operation_lock: Arc<AsyncRwLock<()>>,
    task_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BackgroundTaskManager {
    /// Create a new background task manager. Does nothing until `start` is
    /// called; a `None` interval means the caller never intends to start it.
    pub fn new(interval_ms: Option<u64>, bouquet: Arc<Bouquet>, operation_lock: Arc<AsyncRwLock<()>>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            interval_ms,
            bouquet,
            operation_lock,
            task_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Start the background vacuum task. A no-op returning `Ok(())` if no
    /// interval is configured.
    pub fn start(&self) -> Result<()> {
        let Some(interval_ms) = self.interval_ms else {
            return Ok(());
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PackError::Internal {
                message: "background vacuum task is already running".to_string(),
            });
        }

        log::info!("starting background vacuum task with interval {interval_ms}ms");
        let handle = self.start_vacuum_task(interval_ms);
        *self.task_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the background vacuum task, if running.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        log::info!("background vacuum task stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn start_vacuum_task(&self, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let bouquet = self.bouquet.clone();
        let operation_lock = self.operation_lock.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }

                if let Ok(_lock) = operation_lock.try_read() {
                    match vacuum::run(&bouquet, &BestFitStrategy) {
                        Ok(stats) if stats.moves_planned > 0 || stats.pages_released > 0 => {
                            log::debug!(
                                "background vacuum reclaimed {} byte(s) across {} page(s)",
                                stats.bytes_reclaimed,
                                stats.pages_released
                            );
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("background vacuum failed: {e}"),
                    }
                } else {
                    log::debug!("skipping background vacuum - manual operation in progress");
                }
            }
        })
    }

    pub fn get_stats(&self) -> BackgroundTaskStats {
        BackgroundTaskStats {
            is_running: self.is_running(),
            vacuum_interval_ms: self.interval_ms,
        }
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.task_handle.lock().take() {
                handle.abort();
            }
        }
    }
}

/// Statistics about the background vacuum task.
#[derive(Debug, Clone)]
pub struct BackgroundTaskStats {
    pub is_running: bool,
    pub vacuum_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_boundary::AddressBoundary;
    use crate::address_locker::AddressLocker;
    use crate::address_page_pool::AddressPagePool;
    use crate::by_remaining::ByRemainingTable;
    use crate::header::Header;
    use crate::interim_pool::InterimPagePool;
    use crate::lookup_page::LookupPagePool;
    use crate::metrics::MetricsCollector;
    use crate::options::Options;
    use crate::sheaf::Sheaf;
    use crate::temporary_pool::TemporaryPool;
    use crate::vacuum_tracker::VacuumTracker;
    use parking_lot::Mutex as PlMutex;
    use tempfile::tempdir;

    fn test_bouquet() -> (Arc<Bouquet>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let options = Options::low_memory().unwrap();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("bg.pack"), options.page_size).unwrap());
        let header = Header::fresh(&options);
        let boundary = Arc::new(AddressBoundary::new(sheaf.clone(), header.address_boundary));
        let interim_start = header.address_boundary + options.page_size as u64;
        let interim = Arc::new(InterimPagePool::new(sheaf.clone(), interim_start));
        let lookup = Arc::new(LookupPagePool::new(sheaf.clone(), interim.clone(), options.lookup_block_sizes.clone()));
        let by_remaining_pos = interim.allocate().unwrap();
        let by_remaining = Arc::new(ByRemainingTable::create(sheaf.clone(), lookup.clone(), by_remaining_pos, options.alignment).unwrap());
        let address_pages = Arc::new(AddressPagePool::new(sheaf.clone(), boundary.clone()));
        let locker = Arc::new(AddressLocker::new(options.address_locker_buckets));
        let temporary = Arc::new(TemporaryPool::new(sheaf.clone(), interim.clone(), 0));
        let journal_slots = Arc::new(crate::bouquet::JournalSlots::new(vec![0; options.journal_count as usize]));
        let metrics = Arc::new(MetricsCollector::new());
        let vacuum_tracker = Arc::new(VacuumTracker::new());

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
            vacuum_mutex: PlMutex::new(()),
            options,
            header: PlMutex::new(header),
        });
        bouquet.persist_header(false).unwrap();
        (bouquet, dir)
    }

    #[tokio::test]
    async fn start_stop_toggles_is_running() {
        let (bouquet, _dir) = test_bouquet();
        let manager = BackgroundTaskManager::new(Some(50), bouquet, Arc::new(AsyncRwLock::new(())));
        assert!(!manager.is_running());
        manager.start().unwrap();
        assert!(manager.is_running());
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (bouquet, _dir) = test_bouquet();
        let manager = BackgroundTaskManager::new(Some(50), bouquet, Arc::new(AsyncRwLock::new(())));
        manager.start().unwrap();
        assert!(manager.start().is_err());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn no_interval_configured_is_a_no_op_start() {
        let (bouquet, _dir) = test_bouquet();
        let manager = BackgroundTaskManager::new(None, bouquet, Arc::new(AsyncRwLock::new(())));
        manager.start().unwrap();
        assert!(!manager.is_running());
    }
}
