//! Journal: an append-only, per-transaction operation log.
//!
//! A journal is a linked list of journal pages, each holding a checksummed
//! sequence of variable-length [`Operation`] records terminated (eventually)
//! by a `TERMINATE` record. Pages are chained with a `NextOperation` record
//! rather than a dedicated "next page" header field, so the same cursor that
//! walks operations also walks pages (SPEC_FULL.md §4.6).
//!
//! Grounded on the teacher's append-only checkpoint file writer
//! (`checkpoint.rs`'s metadata framing), adapted from whole-file snapshots to
//! a page-chained, checksummed operation stream.

use std::sync::Arc;

use crate::common::{Address, PackError, Position, Result};
use crate::interim_pool::InterimPagePool;
use crate::sheaf::Sheaf;

pub const PAGE_HEADER_LEN: usize = 12; // checksum(8) + flags(4)

const TAG_NEXT_OPERATION: u16 = 1;
const TAG_MOVE_PAGE: u16 = 2;
const TAG_CREATE_ADDRESS_PAGE: u16 = 3;
const TAG_WRITE: u16 = 4;
const TAG_FREE: u16 = 5;
const TAG_TEMPORARY: u16 = 6;
const TAG_MOVE: u16 = 7;
const TAG_CHECKPOINT: u16 = 8;
const TAG_COMMIT: u16 = 9;
const TAG_TERMINATE: u16 = 10;

const TAG_LEN: usize = 2;

/// One record in a journal. See SPEC_FULL.md §4.6 for the tag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    NextOperation { next: Position },
    MovePage { from: Position, to: Position },
    CreateAddressPage { position: Position, moved_to: Position },
    Write { address: Address, interim_pos: Position },
    Free { address: Address },
    Temporary { address: Address, temp_node: Address },
    Move { from: Position, to: Position, truncate_at: Address },
    Checkpoint { new_start: Position },
    Commit,
    Terminate,
}

impl Operation {
    fn tag(&self) -> u16 {
        match self {
            Operation::NextOperation { .. } => TAG_NEXT_OPERATION,
            Operation::MovePage { .. } => TAG_MOVE_PAGE,
            Operation::CreateAddressPage { .. } => TAG_CREATE_ADDRESS_PAGE,
            Operation::Write { .. } => TAG_WRITE,
            Operation::Free { .. } => TAG_FREE,
            Operation::Temporary { .. } => TAG_TEMPORARY,
            Operation::Move { .. } => TAG_MOVE,
            Operation::Checkpoint { .. } => TAG_CHECKPOINT,
            Operation::Commit => TAG_COMMIT,
            Operation::Terminate => TAG_TERMINATE,
        }
    }

    /// On-disk footprint including the 2-byte tag.
    pub fn encoded_len(&self) -> usize {
        TAG_LEN
            + match self {
                Operation::NextOperation { .. } => 8,
                Operation::MovePage { .. } => 16,
                Operation::CreateAddressPage { .. } => 16,
                Operation::Write { .. } => 16,
                Operation::Free { .. } => 8,
                Operation::Temporary { .. } => 16,
                Operation::Move { .. } => 24,
                Operation::Checkpoint { .. } => 8,
                Operation::Commit => 0,
                Operation::Terminate => 0,
            }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.tag().to_be_bytes());
        let body = &mut buf[TAG_LEN..];
        match *self {
            Operation::NextOperation { next } => put_u64(body, 0, next),
            Operation::MovePage { from, to } => {
                put_u64(body, 0, from);
                put_u64(body, 8, to);
            }
            Operation::CreateAddressPage { position, moved_to } => {
                put_u64(body, 0, position);
                put_u64(body, 8, moved_to);
            }
            Operation::Write { address, interim_pos } => {
                put_u64(body, 0, address);
                put_u64(body, 8, interim_pos);
            }
            Operation::Free { address } => put_u64(body, 0, address),
            Operation::Temporary { address, temp_node } => {
                put_u64(body, 0, address);
                put_u64(body, 8, temp_node);
            }
            Operation::Move { from, to, truncate_at } => {
                put_u64(body, 0, from);
                put_u64(body, 8, to);
                put_u64(body, 16, truncate_at);
            }
            Operation::Checkpoint { new_start } => put_u64(body, 0, new_start),
            Operation::Commit | Operation::Terminate => {}
        }
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TAG_LEN {
            return Err(PackError::Corrupt {
                message: "journal operation tag ran past the end of the page".to_string(),
            });
        }
        let tag = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let body_len = match tag {
            TAG_NEXT_OPERATION | TAG_FREE | TAG_CHECKPOINT => 8,
            TAG_MOVE_PAGE | TAG_CREATE_ADDRESS_PAGE | TAG_WRITE | TAG_TEMPORARY => 16,
            TAG_MOVE => 24,
            TAG_COMMIT | TAG_TERMINATE => 0,
            other => {
                return Err(PackError::Corrupt {
                    message: format!("unknown journal operation tag {other}"),
                });
            }
        };
        if buf.len() < TAG_LEN + body_len {
            return Err(PackError::Corrupt {
                message: "journal operation body ran past the end of the page".to_string(),
            });
        }
        let body = &buf[TAG_LEN..];
        Ok(match tag {
            TAG_NEXT_OPERATION => Operation::NextOperation { next: get_u64(body, 0) },
            TAG_MOVE_PAGE => Operation::MovePage {
                from: get_u64(body, 0),
                to: get_u64(body, 8),
            },
            TAG_CREATE_ADDRESS_PAGE => Operation::CreateAddressPage {
                position: get_u64(body, 0),
                moved_to: get_u64(body, 8),
            },
            TAG_WRITE => Operation::Write {
                address: get_u64(body, 0),
                interim_pos: get_u64(body, 8),
            },
            TAG_FREE => Operation::Free { address: get_u64(body, 0) },
            TAG_TEMPORARY => Operation::Temporary {
                address: get_u64(body, 0),
                temp_node: get_u64(body, 8),
            },
            TAG_MOVE => Operation::Move {
                from: get_u64(body, 0),
                to: get_u64(body, 8),
                truncate_at: get_u64(body, 16),
            },
            TAG_CHECKPOINT => Operation::Checkpoint { new_start: get_u64(body, 0) },
            TAG_COMMIT => Operation::Commit,
            TAG_TERMINATE => Operation::Terminate,
            other => {
                return Err(PackError::Corrupt {
                    message: format!("unknown journal operation tag {other}"),
                });
            }
        })
    }
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// View over one journal page: a checksum, flags, and a run of operations.
pub struct JournalPage<'a> {
    sheaf: &'a Sheaf,
    position: Position,
}

impl<'a> JournalPage<'a> {
    pub fn new(sheaf: &'a Sheaf, position: Position) -> Self {
        Self { sheaf, position }
    }

    pub fn initialize(&self) -> Result<()> {
        self.sheaf.with_page_mut(self.position, |buf| buf.fill(0))
    }

    pub fn read_operation(&self, offset: usize) -> Result<Operation> {
        self.sheaf.with_page(self.position, |buf| Operation::decode(&buf[offset..]))?
    }

    /// Write `op` at `offset`, returning the offset just past it.
    pub fn write_operation(&self, offset: usize, op: Operation) -> Result<usize> {
        let len = op.encoded_len();
        self.sheaf.with_page_mut(self.position, |buf| {
            op.encode(&mut buf[offset..offset + len]);
        })?;
        Ok(offset + len)
    }

    /// Recompute and store the checksum over every byte after the header.
    pub fn finalize(&self) -> Result<()> {
        let digest = self
            .sheaf
            .with_page(self.position, |buf| self.sheaf.checksum(&buf[PAGE_HEADER_LEN..]))?;
        self.sheaf
            .with_page_mut(self.position, |buf| put_u64(buf, 0, digest))
    }

    /// Whether the stored checksum matches the page's current contents.
    pub fn verify(&self) -> Result<bool> {
        self.sheaf.with_page(self.position, |buf| {
            let stored = get_u64(buf, 0);
            let actual = self.sheaf.checksum(&buf[PAGE_HEADER_LEN..]);
            stored == actual
        })
    }
}

/// Reserve enough room at the tail of a page for a `NextOperation` record so
/// the writer never has to backtrack once it decides to chain a new page.
const NEXT_OPERATION_RESERVE: usize = TAG_LEN + 8;

/// Appends operations to a journal, allocating new chained pages as needed.
pub struct JournalWriter {
    sheaf: Arc<Sheaf>,
    interim: Arc<InterimPagePool>,
    first_page: Position,
    current_page: Position,
    offset: usize,
    page_size: usize,
    bytes_written: u64,
    pages: Vec<Position>,
}

impl JournalWriter {
    pub fn new(sheaf: Arc<Sheaf>, interim: Arc<InterimPagePool>) -> Result<Self> {
        let page_size = sheaf.page_size() as usize;
        let first_page = interim.allocate()?;
        JournalPage::new(&sheaf, first_page).initialize()?;
        Ok(Self {
            sheaf,
            interim,
            first_page,
            current_page: first_page,
            offset: PAGE_HEADER_LEN,
            page_size,
            bytes_written: 0,
            pages: vec![first_page],
        })
    }

    /// Position of the journal's first page; this is what gets written into
    /// the header's per-journal start slot once the writer finishes.
    pub fn first_page(&self) -> Position {
        self.first_page
    }

    /// Total encoded bytes appended so far, for `MetricsCollector::record_journal_bytes_written`.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Every interim page this journal occupies, in chain order. A caller
    /// releases these back to the interim pool once the journal's effects
    /// are durably applied and the journal itself is no longer needed.
    pub fn pages(&self) -> &[Position] {
        &self.pages
    }

    /// Append one operation, chaining to a freshly allocated page first if
    /// it (plus a reserved `NextOperation` slot) would not fit.
    pub fn append(&mut self, op: Operation) -> Result<()> {
        let needed = op.encoded_len();
        self.bytes_written += needed as u64;
        if self.offset + needed + NEXT_OPERATION_RESERVE > self.page_size {
            let next_page = self.interim.allocate()?;
            JournalPage::new(&self.sheaf, next_page).initialize()?;
            let current = JournalPage::new(&self.sheaf, self.current_page);
            current.write_operation(self.offset, Operation::NextOperation { next: next_page })?;
            current.finalize()?;
            self.current_page = next_page;
            self.offset = PAGE_HEADER_LEN;
            self.pages.push(next_page);
        }
        let page = JournalPage::new(&self.sheaf, self.current_page);
        self.offset = page.write_operation(self.offset, op)?;
        Ok(())
    }

    /// Finalize the last page's checksum. Call after the final `Terminate`.
    pub fn finish(self) -> Result<Position> {
        JournalPage::new(&self.sheaf, self.current_page).finalize()?;
        Ok(self.first_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writer() -> (JournalWriter, Arc<Sheaf>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sheaf = Arc::new(Sheaf::open(dir.path().join("j.pack"), 256).unwrap());
        let interim = Arc::new(InterimPagePool::new(sheaf.clone(), 4096));
        (JournalWriter::new(sheaf.clone(), interim).unwrap(), sheaf, dir)
    }

    #[test]
    fn single_page_round_trips() {
        let (mut writer, sheaf, _dir) = writer();
        writer.append(Operation::Write { address: 64, interim_pos: 4096 }).unwrap();
        writer.append(Operation::Commit).unwrap();
        writer.append(Operation::Terminate).unwrap();
        let first = writer.finish().unwrap();

        let page = JournalPage::new(&sheaf, first);
        assert!(page.verify().unwrap());
        let op = page.read_operation(PAGE_HEADER_LEN).unwrap();
        assert_eq!(op, Operation::Write { address: 64, interim_pos: 4096 });
    }

    #[test]
    fn overflow_chains_to_a_new_page() {
        let (mut writer, sheaf, _dir) = writer();
        // Small 256-byte pages leave little room; enough Write ops force a
        // NextOperation chain.
        for i in 0..10u64 {
            writer
                .append(Operation::Write { address: i * 8, interim_pos: i * 8 + 4096 })
                .unwrap();
        }
        writer.append(Operation::Commit).unwrap();
        writer.append(Operation::Terminate).unwrap();
        let first = writer.finish().unwrap();

        let first_page = JournalPage::new(&sheaf, first);
        assert!(first_page.verify().unwrap());

        // Walk the chain and confirm we eventually hit Terminate.
        let mut page_pos = first;
        let mut offset = PAGE_HEADER_LEN;
        let mut saw_terminate = false;
        for _ in 0..64 {
            let page = JournalPage::new(&sheaf, page_pos);
            let op = page.read_operation(offset).unwrap();
            offset += op.encoded_len();
            match op {
                Operation::NextOperation { next } => {
                    page_pos = next;
                    offset = PAGE_HEADER_LEN;
                }
                Operation::Terminate => {
                    saw_terminate = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_terminate);
    }

    #[test]
    fn corrupt_page_fails_verification() {
        let (mut writer, sheaf, _dir) = writer();
        writer.append(Operation::Terminate).unwrap();
        let first = writer.finish().unwrap();
        sheaf.with_page_mut(first, |buf| buf[PAGE_HEADER_LEN] ^= 0xFF).unwrap();
        assert!(!JournalPage::new(&sheaf, first).verify().unwrap());
    }
}
