//! Metrics collection for the pack engine.
//!
//! A lightweight counters/gauges collector exposed as an immutable
//! [`MetricsSnapshot`], following the same atomics-plus-snapshot shape as
//! the reference engine's storage-wide metrics collector, trimmed to the
//! counters SPEC_FULL.md §4.12 actually names.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Atomic counters and gauges updated as the engine runs.
#[derive(Debug)]
pub struct MetricsCollector {
    allocations_total: AtomicU64,
    frees_total: AtomicU64,
    temporary_allocations_total: AtomicU64,
    commits_total: AtomicU64,
    rollbacks_total: AtomicU64,
    vacuum_runs_total: AtomicU64,
    vacuum_bytes_reclaimed_total: AtomicU64,
    address_region_growths_total: AtomicU64,
    journal_bytes_written_total: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            allocations_total: AtomicU64::new(0),
            frees_total: AtomicU64::new(0),
            temporary_allocations_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            rollbacks_total: AtomicU64::new(0),
            vacuum_runs_total: AtomicU64::new(0),
            vacuum_bytes_reclaimed_total: AtomicU64::new(0),
            address_region_growths_total: AtomicU64::new(0),
            journal_bytes_written_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_allocation(&self) {
        self.allocations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.frees_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_temporary_allocation(&self) {
        self.temporary_allocations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vacuum_run(&self, bytes_reclaimed: u64) {
        self.vacuum_runs_total.fetch_add(1, Ordering::Relaxed);
        self.vacuum_bytes_reclaimed_total
            .fetch_add(bytes_reclaimed, Ordering::Relaxed);
    }

    pub fn record_address_region_growth(&self) {
        self.address_region_growths_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_journal_bytes_written(&self, bytes: u64) {
        self.journal_bytes_written_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Capture a point-in-time snapshot. `address_boundary` and
    /// `held_address_locks` are gauges read from live state rather than
    /// accumulated here, since they reflect current size, not a count of
    /// events.
    pub fn snapshot(&self, address_boundary: u64, held_address_locks: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            allocations_total: self.allocations_total.load(Ordering::Relaxed),
            frees_total: self.frees_total.load(Ordering::Relaxed),
            temporary_allocations_total: self.temporary_allocations_total.load(Ordering::Relaxed),
            commits_total: self.commits_total.load(Ordering::Relaxed),
            rollbacks_total: self.rollbacks_total.load(Ordering::Relaxed),
            vacuum_runs_total: self.vacuum_runs_total.load(Ordering::Relaxed),
            vacuum_bytes_reclaimed_total: self.vacuum_bytes_reclaimed_total.load(Ordering::Relaxed),
            address_region_growths_total: self.address_region_growths_total.load(Ordering::Relaxed),
            journal_bytes_written_total: self.journal_bytes_written_total.load(Ordering::Relaxed),
            address_boundary,
            held_address_locks: held_address_locks as u64,
        }
    }
}

/// Snapshot of metrics at a point in time, returned by `Pack::metrics()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub allocations_total: u64,
    pub frees_total: u64,
    pub temporary_allocations_total: u64,
    pub commits_total: u64,
    pub rollbacks_total: u64,
    pub vacuum_runs_total: u64,
    pub vacuum_bytes_reclaimed_total: u64,
    pub address_region_growths_total: u64,
    pub journal_bytes_written_total: u64,
    pub address_boundary: u64,
    pub held_address_locks: u64,
}
