//! Address page pool: finds an address-region page with a free slot to
//! reserve, and reports how many such pages are known, driving the
//! address-region growth decision in [`crate::bouquet`].
//!
//! Grounded on the same lazy-rescan-on-exhaustion shape as
//! [`crate::interim_pool::InterimPagePool`], adapted because address pages
//! cannot be handed out or released wholesale — only individual slots
//! within them come and go.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address_boundary::AddressBoundary;
use crate::address_page::AddressPage;
use crate::common::{Address, PackError, Result};
use crate::sheaf::Sheaf;

pub struct AddressPagePool {
    sheaf: Arc<Sheaf>,
    boundary: Arc<AddressBoundary>,
    known_free: Mutex<VecDeque<u64>>,
}

impl AddressPagePool {
    pub fn new(sheaf: Arc<Sheaf>, boundary: Arc<AddressBoundary>) -> Self {
        Self {
            sheaf,
            boundary,
            known_free: Mutex::new(VecDeque::new()),
        }
    }

    fn rescan(&self) -> Result<VecDeque<u64>> {
        let page_size = self.sheaf.page_size() as u64;
        let boundary = self.boundary.boundary();
        let mut found = VecDeque::new();
        let mut position = page_size; // page 0 is the header
        while position < boundary {
            if AddressPage::new(&self.sheaf, position, 1).free_count()? > 0 {
                found.push_back(position);
            }
            position += page_size;
        }
        Ok(found)
    }

    /// Number of address pages currently known to have at least one free
    /// slot. Triggers a rescan if the cached set has run dry.
    pub fn free_page_count(&self) -> Result<usize> {
        let mut known = self.known_free.lock();
        if known.is_empty() {
            *known = self.rescan()?;
        }
        Ok(known.len())
    }

    /// Total free address slots across every page known to have room.
    /// This, not the page count, is what `Options::address_page_pool_size`
    /// bounds (SPEC_FULL.md §4.1/§6): a single mostly-empty address page can
    /// satisfy thousands of reservations before the region needs to grow.
    pub fn free_slot_count(&self) -> Result<usize> {
        let mut known = self.known_free.lock();
        if known.is_empty() {
            *known = self.rescan()?;
        }
        let mut total = 0;
        for &position in known.iter() {
            total += AddressPage::new(&self.sheaf, position, 1).free_count()?;
        }
        Ok(total)
    }

    /// Reserve a fresh address, scanning for a page with room if the cache
    /// is empty or stale.
    pub fn reserve(&self) -> Result<Address> {
        loop {
            let candidate = {
                let mut known = self.known_free.lock();
                if known.is_empty() {
                    *known = self.rescan()?;
                }
                known.front().copied()
            };
            let Some(position) = candidate else {
                return Err(PackError::AddressPoolExhausted);
            };
            let page = AddressPage::new(&self.sheaf, position, 1);
            match page.reserve()? {
                Some(address) => {
                    if page.free_count()? == 0 {
                        self.known_free.lock().retain(|&p| p != position);
                    }
                    return Ok(address);
                }
                None => {
                    // Another caller filled it since the last scan; drop it
                    // and retry with the next candidate.
                    self.known_free.lock().retain(|&p| p != position);
                }
            }
        }
    }

    /// Note a page as promoted out of the user region, still within the
    /// address region, and reconsider its head count.
    pub fn admit(&self, position: u64) -> Result<()> {
        if AddressPage::new(&self.sheaf, position, 1).free_count()? > 0 {
            self.known_free.lock().push_back(position);
        }
        Ok(())
    }
}
