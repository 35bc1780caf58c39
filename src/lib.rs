//! # pack: a single-file paged block-storage engine
//!
//! `pack` stores variable-length blocks inside a single backing file behind
//! stable 64-bit addresses, with crash-consistent durability through a
//! write-ahead journal and idempotent replay, and periodic vacuum compaction
//! to reclaim space fragmented by frees.
//!
//! ## Core features
//!
//! - **Stable addresses**: an address survives every vacuum move and every
//!   crash; it always resolves to the block's current content or `None`.
//! - **Transactional mutators**: a [`Mutator`] batches allocate/write/free
//!   calls and commits them atomically through the journal.
//! - **Crash recovery**: an interrupted journal replays idempotently at the
//!   next open; abandoned temporary blocks are swept automatically.
//! - **Vacuum compaction**: a pluggable strategy consolidates sparse pages
//!   in the background or on demand.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pack::{Pack, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pack = Pack::open("store.pack", Options::default()).await?;
//!
//!     let mut mutator = pack.mutate();
//!     let address = mutator.allocate(11).await?;
//!     mutator.write(address, b"hello world").await?;
//!     mutator.commit().await?;
//!
//!     let reader = pack.mutate();
//!     let payload = reader.read(address).await?;
//!     println!("{:?}", payload);
//!
//!     pack.close().await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod address_boundary;
pub mod address_locker;
pub mod address_page;
pub mod address_page_pool;
pub mod background;
pub mod block_page;
pub mod bouquet;
pub mod by_remaining;
pub mod checksum;
pub mod common;
pub mod header;
pub mod interim_pool;
pub mod journal;
pub mod lookup_page;
pub mod metrics;
pub mod mutator;
pub mod options;
pub mod pack;
pub mod player;
pub mod recovery;
pub mod sheaf;
pub mod temporary_pool;
pub mod vacuum;
pub mod vacuum_tracker;

pub use background::{BackgroundTaskManager, BackgroundTaskStats};
pub use common::{Address, PackError, Position, Result};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use mutator::Mutator;
pub use options::{Options, SyncMode};
pub use pack::Pack;
pub use vacuum::{BestFitStrategy, MoveRecorder, VacuumStats, VacuumStrategy};
