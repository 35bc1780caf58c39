//! Configuration for a [`crate::pack::Pack`] instance.
//!
//! Mirrors the validated-config-struct-with-presets pattern used throughout
//! this codebase's ambient configuration surface.

use serde::{Deserialize, Serialize};

use crate::common::{PackError, Result};

/// Synchronization policy controlling when `commit()` forces the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Never force explicitly; rely on the OS page cache and an explicit
    /// `Pack::force()` call by the caller.
    None,
    /// Force on an interval, driven by the background task manager.
    Periodic,
    /// Force after every commit (slowest, strongest durability).
    Always,
}

/// Configuration for opening or creating a pack file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Page size in bytes. Must be a power of two.
    pub page_size: u32,
    /// Free-space bucket alignment in bytes. Must divide `page_size`.
    pub alignment: u32,
    /// Number of concurrent journals the engine may use at once.
    pub journal_count: u32,
    /// Number of named entries reserved in the static block map.
    pub static_block_count: u32,
    /// Minimum number of free address-page slots to keep on hand; growth of
    /// the address region is triggered when the pool drops below this.
    pub address_page_pool_size: u32,
    /// Strictly increasing ladder of lookup-page block sizes (in 64-bit
    /// values), smallest first.
    pub lookup_block_sizes: Vec<u32>,
    /// Number of hash buckets in the address locker.
    pub address_locker_buckets: u32,
    /// Interval, in milliseconds, on which the background task manager runs
    /// vacuum. `None` disables the background task entirely.
    pub vacuum_interval_ms: Option<u64>,
    /// Durability policy for `commit()`.
    pub sync_mode: SyncMode,
}

impl Options {
    /// Validate the configuration, returning a descriptive error for the
    /// first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 512 {
            return Err(PackError::InvalidConfig {
                message: "page_size must be at least 512 bytes".to_string(),
            });
        }
        if !self.page_size.is_power_of_two() {
            return Err(PackError::InvalidConfig {
                message: "page_size must be a power of two".to_string(),
            });
        }
        if self.alignment == 0 || self.page_size % self.alignment != 0 {
            return Err(PackError::InvalidConfig {
                message: "alignment must be non-zero and divide page_size".to_string(),
            });
        }
        if self.journal_count == 0 {
            return Err(PackError::InvalidConfig {
                message: "journal_count must be at least 1".to_string(),
            });
        }
        if self.address_page_pool_size == 0 {
            return Err(PackError::InvalidConfig {
                message: "address_page_pool_size must be at least 1".to_string(),
            });
        }
        if self.address_locker_buckets == 0 {
            return Err(PackError::InvalidConfig {
                message: "address_locker_buckets must be at least 1".to_string(),
            });
        }
        if self.lookup_block_sizes.is_empty() {
            return Err(PackError::InvalidConfig {
                message: "lookup_block_sizes must not be empty".to_string(),
            });
        }
        if !self.lookup_block_sizes.windows(2).all(|w| w[0] < w[1]) {
            return Err(PackError::InvalidConfig {
                message: "lookup_block_sizes must be strictly increasing".to_string(),
            });
        }
        if let Some(ms) = self.vacuum_interval_ms {
            if ms < 100 {
                return Err(PackError::InvalidConfig {
                    message: "vacuum_interval_ms must be at least 100ms".to_string(),
                });
            }
        }
        Ok(())
    }

    /// A configuration tuned for small files and tests: small pages, a
    /// single journal, a short vacuum interval.
    pub fn low_memory() -> Result<Self> {
        let mut opts = Self::default();
        opts.page_size = 4096;
        opts.alignment = 32;
        opts.journal_count = 1;
        opts.address_page_pool_size = 2;
        opts.lookup_block_sizes = vec![8, 32, 128];
        opts.vacuum_interval_ms = Some(1000);
        opts.validate()?;
        Ok(opts)
    }

    /// A configuration tuned for throughput: larger pages, more journals,
    /// background vacuum on a longer interval.
    pub fn high_performance() -> Result<Self> {
        let mut opts = Self::default();
        opts.page_size = 65536;
        opts.alignment = 256;
        opts.journal_count = 8;
        opts.address_page_pool_size = 16;
        opts.lookup_block_sizes = vec![8, 64, 512, 4096];
        opts.vacuum_interval_ms = Some(30_000);
        opts.validate()?;
        Ok(opts)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: 8192,
            alignment: 64,
            journal_count: 4,
            static_block_count: 16,
            address_page_pool_size: 4,
            lookup_block_sizes: vec![8, 64, 512, 2048],
            address_locker_buckets: 37,
            vacuum_interval_ms: None,
            sync_mode: SyncMode::Always,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut opts = Options::default();
        opts.page_size = 4097;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_alignment_not_dividing_page_size() {
        let mut opts = Options::default();
        opts.alignment = 100;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_zero_journal_count() {
        let mut opts = Options::default();
        opts.journal_count = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_non_increasing_lookup_sizes() {
        let mut opts = Options::default();
        opts.lookup_block_sizes = vec![8, 8, 4];
        assert!(opts.validate().is_err());
    }

    #[test]
    fn presets_validate() {
        Options::low_memory().unwrap();
        Options::high_performance().unwrap();
    }
}
