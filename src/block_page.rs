//! Block page: the layout shared by user and interim block pages.
//!
//! `[checksum:i64, count:i32, blocks...]` where each block is
//! `[size:i32, address:i64, payload[size-BLOCK_HEADER_LEN]]`. `size` is the
//! block's full on-page footprint (header included); a negative `size`
//! marks a tombstoned block whose footprint is still `size.unsigned_abs()`.
//! `count` is stored with the top bit set for user pages, clear for interim
//! pages; a stored count with the bit set on a page opened as interim is
//! corruption (SPEC_FULL.md §4.3).

use crate::common::{Address, PackError, Position, Result};
use crate::sheaf::Sheaf;

pub const HEADER_LEN: usize = 12; // checksum(8) + count(4)
pub const BLOCK_HEADER_LEN: usize = 12; // size(4) + address(8)
const USER_COUNT_BIT: u32 = 1 << 31;
const CHECKSUM_LEN: usize = 8;

/// One block record found while scanning a page.
#[derive(Debug, Clone, Copy)]
struct Record {
    offset: usize,
    footprint: usize,
    address: Address,
    tombstoned: bool,
}

pub struct BlockPage<'a> {
    sheaf: &'a Sheaf,
    position: Position,
    is_user: bool,
}

impl<'a> BlockPage<'a> {
    pub fn new(sheaf: &'a Sheaf, position: Position, is_user: bool) -> Self {
        Self {
            sheaf,
            position,
            is_user,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Zero out the page and write an empty, valid header.
    pub fn initialize(&self) -> Result<()> {
        self.sheaf.with_page_mut(self.position, |buf| {
            buf.fill(0);
            write_count(buf, 0, self.is_user);
            self.store_checksum(buf);
        })
    }

    /// Recompute and store the checksum over every byte after the header.
    /// Called at the end of every mutating operation.
    fn store_checksum(&self, buf: &mut [u8]) {
        let digest = self.sheaf.checksum(&buf[HEADER_LEN..]);
        buf[0..CHECKSUM_LEN].copy_from_slice(&digest.to_be_bytes());
    }

    fn verify_checksum(&self, buf: &[u8]) -> Result<()> {
        let stored = u64::from_be_bytes(buf[0..CHECKSUM_LEN].try_into().unwrap());
        let actual = self.sheaf.checksum(&buf[HEADER_LEN..]);
        if stored != actual {
            return Err(PackError::BlockPageCorrupt {
                position: self.position,
                message: format!("checksum mismatch: stored {stored:#x}, computed {actual:#x}"),
            });
        }
        Ok(())
    }

    fn raw_count(&self, buf: &[u8]) -> Result<u32> {
        let stored = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let flagged = stored & USER_COUNT_BIT != 0;
        if flagged != self.is_user {
            return Err(PackError::BlockPageCorrupt {
                position: self.position,
                message: format!(
                    "page user-bit {flagged} does not match expected kind (is_user={})",
                    self.is_user
                ),
            });
        }
        Ok(stored & !USER_COUNT_BIT)
    }

    /// Decode every block record on the page, verifying the page checksum
    /// first (SPEC_FULL.md §3, §7 `BLOCK_PAGE_CORRUPT`).
    fn records(&self, buf: &[u8]) -> Result<Vec<Record>> {
        self.verify_checksum(buf)?;
        let count = self.raw_count(buf)?;
        let mut records = Vec::with_capacity(count as usize);
        let mut offset = HEADER_LEN;
        for _ in 0..count {
            if offset + BLOCK_HEADER_LEN > buf.len() {
                return Err(PackError::BlockPageCorrupt {
                    position: self.position,
                    message: "block header ran past the end of the page".to_string(),
                });
            }
            let size = i32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
            let address = u64::from_be_bytes(buf[offset + 4..offset + 12].try_into().unwrap());
            let footprint = size.unsigned_abs() as usize;
            if offset + footprint > buf.len() {
                return Err(PackError::BlockPageCorrupt {
                    position: self.position,
                    message: "block payload ran past the end of the page".to_string(),
                });
            }
            records.push(Record {
                offset,
                footprint,
                address,
                tombstoned: size < 0,
            });
            offset += footprint;
        }
        Ok(records)
    }

    fn tail_offset(records: &[Record]) -> usize {
        records
            .last()
            .map(|r| r.offset + r.footprint)
            .unwrap_or(HEADER_LEN)
    }

    /// Bytes free after the last block record.
    pub fn remaining(&self) -> Result<u32> {
        let page_size = self.sheaf.page_size();
        self.sheaf.with_page(self.position, |buf| {
            let records = self.records(buf)?;
            Ok(page_size - Self::tail_offset(&records) as u32)
        })?
    }

    /// Append a new (uninitialized-payload) block reserving `payload_len`
    /// bytes for `address`. Errors if there is not enough remaining space.
    pub fn allocate(&self, address: Address, payload_len: usize) -> Result<()> {
        let footprint = BLOCK_HEADER_LEN + payload_len;
        self.sheaf.with_page_mut(self.position, |buf| {
            let records = self.records(buf)?;
            let tail = Self::tail_offset(&records);
            if tail + footprint > buf.len() {
                return Err(PackError::AllocationFailed {
                    size: footprint as u32,
                });
            }
            buf[tail..tail + 4].copy_from_slice(&(footprint as i32).to_be_bytes());
            buf[tail + 4..tail + 12].copy_from_slice(&address.to_be_bytes());
            write_count(buf, records.len() as u32 + 1, self.is_user);
            self.store_checksum(buf);
            Ok(())
        })?
    }

    /// Overwrite the payload of an existing, same-size block.
    pub fn write(&self, address: Address, payload: &[u8]) -> Result<()> {
        self.sheaf.with_page_mut(self.position, |buf| {
            let records = self.records(buf)?;
            let record = records
                .iter()
                .find(|r| r.address == address && !r.tombstoned)
                .ok_or(PackError::FreedAddress { address })?;
            let capacity = record.footprint - BLOCK_HEADER_LEN;
            if capacity != payload.len() {
                return Err(PackError::AllocationFailed {
                    size: payload.len() as u32,
                });
            }
            let start = record.offset + BLOCK_HEADER_LEN;
            buf[start..start + payload.len()].copy_from_slice(payload);
            self.store_checksum(buf);
            Ok(())
        })?
    }

    /// Read the live payload bound to `address`, if any.
    pub fn read(&self, address: Address) -> Result<Option<Vec<u8>>> {
        self.sheaf.with_page(self.position, |buf| {
            let records = self.records(buf)?;
            Ok(records
                .iter()
                .find(|r| r.address == address && !r.tombstoned)
                .map(|r| {
                    let start = r.offset + BLOCK_HEADER_LEN;
                    buf[start..r.offset + r.footprint].to_vec()
                }))
        })?
    }

    /// Tombstone the block bound to `address`. Returns whether a live block
    /// was actually found and freed (idempotent for replay).
    pub fn free(&self, address: Address) -> Result<bool> {
        self.sheaf.with_page_mut(self.position, |buf| {
            let records = self.records(buf)?;
            if let Some(record) = records.iter().find(|r| r.address == address && !r.tombstoned) {
                let negated = -(record.footprint as i32);
                buf[record.offset..record.offset + 4].copy_from_slice(&negated.to_be_bytes());
                self.store_checksum(buf);
                Ok(true)
            } else {
                Ok(false)
            }
        })?
    }

    /// Copy the live block bound to `address` from `self` onto `dest`,
    /// appending it verbatim (used by the player's `MOVE`/vacuum flow).
    pub fn copy(&self, address: Address, dest: &BlockPage<'_>) -> Result<()> {
        let payload = self
            .read(address)?
            .ok_or(PackError::FreedAddress { address })?;
        dest.allocate(address, payload.len())?;
        dest.write(address, &payload)
    }

    /// Discard every block after (and not including) the one bound to
    /// `keep_last`; pass `0` to truncate to empty. Used to make `MOVE`
    /// replay deterministic regardless of how many times it has run.
    pub fn truncate_after(&self, keep_last: Address) -> Result<()> {
        self.sheaf.with_page_mut(self.position, |buf| {
            let records = self.records(buf)?;
            let keep = if keep_last == 0 {
                0
            } else {
                let idx = records
                    .iter()
                    .position(|r| r.address == keep_last)
                    .ok_or_else(|| PackError::Internal {
                        message: format!("truncate target {keep_last} not present on page"),
                    })?;
                idx + 1
            };
            write_count(buf, keep as u32, self.is_user);
            self.store_checksum(buf);
            Ok(())
        })?
    }

    /// Compact out tombstoned blocks in place, rewriting the page tightly
    /// packed. Returns the new remaining-bytes value.
    pub fn purge(&self) -> Result<u32> {
        let page_size = self.sheaf.page_size();
        self.sheaf.with_page_mut(self.position, |buf| {
            let records = self.records(buf)?;
            let live: Vec<Record> = records.into_iter().filter(|r| !r.tombstoned).collect();
            let mut scratch = vec![0u8; buf.len()];
            let mut write_offset = HEADER_LEN;
            for record in &live {
                let footprint = record.footprint;
                scratch[write_offset..write_offset + footprint]
                    .copy_from_slice(&buf[record.offset..record.offset + footprint]);
                write_offset += footprint;
            }
            buf[HEADER_LEN..].copy_from_slice(&scratch[HEADER_LEN..]);
            write_count(buf, live.len() as u32, self.is_user);
            self.store_checksum(buf);
            Ok(page_size - write_offset as u32)
        })?
    }

    /// Promote a page written as an interim scratch page (count's user bit
    /// clear) into a user page (bit set), in place, without moving or
    /// copying any block data. The count field sits outside the
    /// checksummed region, so flipping it never invalidates the page's
    /// checksum. A no-op if the bit is already set.
    ///
    /// Used by the player's `WRITE` replay once a mutator's interim block
    /// page becomes the permanent, addressable home for its blocks
    /// (SPEC_FULL.md §3, §4.3, §4.7): the interim page is adopted in place
    /// rather than copied elsewhere, since `WRITE`'s payload already is the
    /// interim position the address should resolve to.
    pub fn promote_interim_to_user(sheaf: &Sheaf, position: Position) -> Result<()> {
        sheaf.with_page_mut(position, |buf| {
            let stored = u32::from_be_bytes(buf[8..12].try_into().unwrap());
            if stored & USER_COUNT_BIT == 0 {
                buf[8..12].copy_from_slice(&(stored | USER_COUNT_BIT).to_be_bytes());
            }
        })
    }

    /// Every live address currently stored on this page.
    pub fn live_addresses(&self) -> Result<Vec<Address>> {
        self.sheaf.with_page(self.position, |buf| {
            Ok(self
                .records(buf)?
                .into_iter()
                .filter(|r| !r.tombstoned)
                .map(|r| r.address)
                .collect())
        })?
    }

    /// The last live address on this page, or `0` if it holds none. Used to
    /// compute a `Move` operation's `truncate_at` so replaying it against a
    /// destination page is deterministic regardless of how many times it runs.
    pub fn last_address(&self) -> Result<Address> {
        Ok(self.live_addresses()?.last().copied().unwrap_or(0))
    }
}

fn write_count(buf: &mut [u8], count: u32, is_user: bool) {
    let stored = if is_user { count | USER_COUNT_BIT } else { count };
    buf[8..12].copy_from_slice(&stored.to_be_bytes());
}
