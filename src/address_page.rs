//! Address page: a flat array of 8-byte indirection slots.
//!
//! A slot is one of: `0` (free), `u64::MAX` (reserved, not yet committed),
//! or a page position referencing the block page currently holding the
//! block. When a page has been promoted from the user region (see
//! [`crate::address_boundary`]), slot 0 is reserved for the forward
//! reference left behind by the promotion and is skipped by `reserve`.

use crate::common::{Address, FREE_SLOT, PackError, Position, RESERVED_SLOT, Result};
use crate::sheaf::Sheaf;

/// View over one address page's slots.
pub struct AddressPage<'a> {
    sheaf: &'a Sheaf,
    position: Position,
    slot_count: usize,
    first_usable_slot: usize,
}

impl<'a> AddressPage<'a> {
    /// `first_usable_slot` is 1 for a page that was promoted from the user
    /// region (slot 0 holds the forward reference), 0 otherwise.
    pub fn new(sheaf: &'a Sheaf, position: Position, first_usable_slot: usize) -> Self {
        let slot_count = sheaf.page_size() as usize / 8;
        Self {
            sheaf,
            position,
            slot_count,
            first_usable_slot,
        }
    }

    fn slot_offset(&self, index: usize) -> usize {
        index * 8
    }

    fn read_slot(&self, index: usize) -> Result<u64> {
        self.sheaf.with_page(self.position, |bytes| {
            let off = self.slot_offset(index);
            u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap())
        })
    }

    fn write_slot(&self, index: usize, value: u64) -> Result<()> {
        self.sheaf.with_page_mut(self.position, |bytes| {
            let off = self.slot_offset(index);
            bytes[off..off + 8].copy_from_slice(&value.to_be_bytes());
        })
    }

    /// Zero-initialize every usable slot. Used when a page is first turned
    /// into an address page.
    pub fn initialize(&self) -> Result<()> {
        self.sheaf.with_page_mut(self.position, |bytes| {
            for index in self.first_usable_slot..self.slot_count {
                let off = index * 8;
                bytes[off..off + 8].copy_from_slice(&0u64.to_be_bytes());
            }
        })
    }

    /// Set the forward reference for a page promoted from the user region.
    pub fn set_forward_reference(&self, moved_to: Position) -> Result<()> {
        debug_assert_eq!(self.first_usable_slot, 1, "only promoted pages have a forward reference");
        self.write_slot(0, moved_to)
    }

    pub fn forward_reference(&self) -> Result<Position> {
        self.read_slot(0)
    }

    /// Reserve the first free slot, returning its address (absolute byte
    /// offset) with the slot set to `RESERVED_SLOT`.
    pub fn reserve(&self) -> Result<Option<Address>> {
        for index in self.first_usable_slot..self.slot_count {
            if self.read_slot(index)? == FREE_SLOT {
                self.write_slot(index, RESERVED_SLOT)?;
                return Ok(Some(self.position + self.slot_offset(index) as u64));
            }
        }
        Ok(None)
    }

    /// Set an address slot to a committed position.
    pub fn set(&self, address: Address, position: Position) -> Result<()> {
        let index = self.index_of(address)?;
        self.write_slot(index, position)
    }

    /// Read a slot's raw value without treating `FREE_SLOT` as an error.
    /// Used by replay to decide whether an operation has already taken
    /// effect before redoing it.
    pub fn raw(&self, address: Address) -> Result<u64> {
        let index = self.index_of(address)?;
        self.read_slot(index)
    }

    /// Resolve an address slot to its current position. Returns an error if
    /// the slot is free or only reserved (not yet committed).
    pub fn dereference(&self, address: Address) -> Result<Position> {
        let index = self.index_of(address)?;
        let value = self.read_slot(index)?;
        if value == FREE_SLOT || value == RESERVED_SLOT {
            return Err(PackError::FreedAddress { address });
        }
        Ok(value)
    }

    /// Free a slot if it is currently non-zero. Returns whether it was
    /// actually freed (idempotent for replay).
    pub fn free(&self, address: Address) -> Result<bool> {
        let index = self.index_of(address)?;
        let current = self.read_slot(index)?;
        if current == FREE_SLOT {
            return Ok(false);
        }
        self.write_slot(index, FREE_SLOT)?;
        Ok(true)
    }

    /// Count of free slots on this page, excluding the reserved slot 0 of a
    /// promoted page.
    pub fn free_count(&self) -> Result<usize> {
        let mut count = 0;
        for index in self.first_usable_slot..self.slot_count {
            if self.read_slot(index)? == FREE_SLOT {
                count += 1;
            }
        }
        Ok(count)
    }

    fn index_of(&self, address: Address) -> Result<usize> {
        if address < self.position {
            return Err(PackError::Internal {
                message: format!("address {address} precedes page position {}", self.position),
            });
        }
        let offset = (address - self.position) as usize;
        if offset % 8 != 0 || offset / 8 >= self.slot_count {
            return Err(PackError::Internal {
                message: format!("address {address} is not a valid slot on page {}", self.position),
            });
        }
        Ok(offset / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sheaf() -> (Sheaf, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (Sheaf::open(dir.path().join("a.pack"), 4096).unwrap(), dir)
    }

    #[test]
    fn reserve_then_set_then_dereference() {
        let (sheaf, _dir) = sheaf();
        let page = AddressPage::new(&sheaf, 0, 0);
        page.initialize().unwrap();
        let addr = page.reserve().unwrap().unwrap();
        page.set(addr, 4096).unwrap();
        assert_eq!(page.dereference(addr).unwrap(), 4096);
    }

    #[test]
    fn dereference_of_free_slot_errors() {
        let (sheaf, _dir) = sheaf();
        let page = AddressPage::new(&sheaf, 0, 0);
        page.initialize().unwrap();
        let err = page.dereference(0).unwrap_err();
        assert!(matches!(err, PackError::FreedAddress { .. }));
    }

    #[test]
    fn free_is_idempotent() {
        let (sheaf, _dir) = sheaf();
        let page = AddressPage::new(&sheaf, 0, 0);
        page.initialize().unwrap();
        let addr = page.reserve().unwrap().unwrap();
        page.set(addr, 8192).unwrap();
        assert!(page.free(addr).unwrap());
        assert!(!page.free(addr).unwrap());
    }

    #[test]
    fn promoted_page_skips_slot_zero() {
        let (sheaf, _dir) = sheaf();
        let page = AddressPage::new(&sheaf, 0, 1);
        page.initialize().unwrap();
        page.set_forward_reference(12345).unwrap();
        let addr = page.reserve().unwrap().unwrap();
        assert_ne!(addr, 0);
        assert_eq!(page.forward_reference().unwrap(), 12345);
    }

    #[test]
    fn free_count_tracks_reservations() {
        let (sheaf, _dir) = sheaf();
        let page = AddressPage::new(&sheaf, 0, 0);
        page.initialize().unwrap();
        let total = page.free_count().unwrap();
        let _ = page.reserve().unwrap().unwrap();
        assert_eq!(page.free_count().unwrap(), total - 1);
    }
}
