//! File header: signature, shutdown flag, region geometry, and the static
//! block map. Lives at position 0 and occupies exactly one page.
//!
//! Field layout follows SPEC_FULL.md §6 bit-exact, all integers big-endian.

use std::collections::BTreeMap;

use crate::common::{Address, PackError, Position, Result};
use crate::options::Options;
use crate::sheaf::Sheaf;

/// Magic bytes identifying a pack file.
pub const SIGNATURE: u64 = 0x5061_636b_4631_0001; // "PackF1" + version

const SHUTDOWN_HARD: u32 = 0;
const SHUTDOWN_SOFT: u32 = 1;

const FIXED_HEADER_LEN: usize = 8 + 4 + 4 + 4 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8;

/// In-memory view of the on-disk header page.
#[derive(Debug, Clone)]
pub struct Header {
    pub shutdown_soft: bool,
    pub page_size: u32,
    pub alignment: u32,
    pub journal_count: u32,
    pub static_block_count: u32,
    pub address_page_pool_size: u32,
    pub address_boundary: Position,
    pub address_lookup_page_pool: Position,
    pub first_temporary_node: Address,
    pub by_remaining_table: Position,
    pub journal_starts: Vec<Position>,
    pub static_blocks: BTreeMap<String, Address>,
}

impl Header {
    /// Build a fresh header for a newly created file.
    pub fn fresh(options: &Options) -> Self {
        Self {
            shutdown_soft: true,
            page_size: options.page_size,
            alignment: options.alignment,
            journal_count: options.journal_count,
            static_block_count: options.static_block_count,
            address_page_pool_size: options.address_page_pool_size,
            address_boundary: options.page_size as Position, // page 0 is the header
            address_lookup_page_pool: 0,
            first_temporary_node: 0,
            by_remaining_table: 0,
            journal_starts: vec![0; options.journal_count as usize],
            static_blocks: BTreeMap::new(),
        }
    }

    fn static_map_offset() -> usize {
        FIXED_HEADER_LEN
    }

    /// Serialize into a page-sized buffer and write it through the sheaf.
    pub fn save(&self, sheaf: &Sheaf) -> Result<()> {
        let size = sheaf.page_size() as usize;
        let mut buf = vec![0u8; size];
        let mut w = 0usize;
        put_u64(&mut buf, &mut w, SIGNATURE);
        put_u32(
            &mut buf,
            &mut w,
            if self.shutdown_soft {
                SHUTDOWN_SOFT
            } else {
                SHUTDOWN_HARD
            },
        );
        put_u32(&mut buf, &mut w, self.page_size);
        put_u32(&mut buf, &mut w, self.alignment);
        put_u32(&mut buf, &mut w, self.journal_count);
        put_u32(&mut buf, &mut w, self.static_block_count);
        put_u32(&mut buf, &mut w, self.address_page_pool_size);
        put_u32(&mut buf, &mut w, FIXED_HEADER_LEN as u32);
        put_u64(&mut buf, &mut w, self.address_boundary);
        put_u64(&mut buf, &mut w, self.address_lookup_page_pool);
        put_u64(&mut buf, &mut w, self.first_temporary_node);
        put_u64(&mut buf, &mut w, self.by_remaining_table);
        debug_assert_eq!(w, FIXED_HEADER_LEN);

        let mut w = Self::static_map_offset();
        for start in &self.journal_starts {
            put_u64(&mut buf, &mut w, *start);
        }

        put_u32(&mut buf, &mut w, self.static_blocks.len() as u32);
        for (uri, addr) in &self.static_blocks {
            let bytes = uri.as_bytes();
            put_u32(&mut buf, &mut w, bytes.len() as u32);
            buf[w..w + bytes.len()].copy_from_slice(bytes);
            w += bytes.len();
            put_u64(&mut buf, &mut w, *addr);
        }
        if w > size {
            return Err(PackError::HeaderCorrupt {
                message: "static block map overflowed the header page".to_string(),
            });
        }

        sheaf.with_page_mut(0, |page| page.copy_from_slice(&buf))?;
        sheaf.flush_and_force()
    }

    /// Read and validate the header page.
    pub fn load(sheaf: &Sheaf) -> Result<Self> {
        let len = sheaf.len()?;
        if len < sheaf.page_size() as u64 {
            return Err(PackError::FileSize {
                actual: len,
                minimum: sheaf.page_size() as u64,
            });
        }
        let page = sheaf.read_page(0)?;
        let mut r = 0usize;
        let signature = get_u64(&page, &mut r);
        if signature != SIGNATURE {
            return Err(PackError::Signature {
                expected: SIGNATURE,
                found: signature,
            });
        }
        let shutdown = get_u32(&page, &mut r);
        let page_size = get_u32(&page, &mut r);
        let alignment = get_u32(&page, &mut r);
        let journal_count = get_u32(&page, &mut r);
        let static_block_count = get_u32(&page, &mut r);
        let address_page_pool_size = get_u32(&page, &mut r);
        let header_size = get_u32(&page, &mut r);
        let address_boundary = get_u64(&page, &mut r);
        let address_lookup_page_pool = get_u64(&page, &mut r);
        let first_temporary_node = get_u64(&page, &mut r);
        let by_remaining_table = get_u64(&page, &mut r);
        if header_size as usize != FIXED_HEADER_LEN {
            return Err(PackError::HeaderCorrupt {
                message: format!("unexpected header_size {header_size}"),
            });
        }

        let mut r = Self::static_map_offset();
        let mut journal_starts = Vec::with_capacity(journal_count as usize);
        for _ in 0..journal_count {
            journal_starts.push(get_u64(&page, &mut r));
        }

        let mut static_blocks = BTreeMap::new();
        let entries = get_u32(&page, &mut r);
        for _ in 0..entries {
            let name_len = get_u32(&page, &mut r) as usize;
            if r + name_len > page.len() {
                return Err(PackError::HeaderCorrupt {
                    message: "static block name overran header page".to_string(),
                });
            }
            let name = String::from_utf8_lossy(&page[r..r + name_len]).into_owned();
            r += name_len;
            let addr = get_u64(&page, &mut r);
            static_blocks.insert(name, addr);
        }

        Ok(Self {
            shutdown_soft: shutdown == SHUTDOWN_SOFT,
            page_size,
            alignment,
            journal_count,
            static_block_count,
            address_page_pool_size,
            address_boundary,
            address_lookup_page_pool,
            first_temporary_node,
            by_remaining_table,
            journal_starts,
            static_blocks,
        })
    }

    pub fn static_block(&self, uri: &str) -> Result<Address> {
        self.static_blocks
            .get(uri)
            .copied()
            .ok_or_else(|| PackError::UnknownStaticBlock {
                uri: uri.to_string(),
            })
    }
}

fn put_u64(buf: &mut [u8], w: &mut usize, v: u64) {
    buf[*w..*w + 8].copy_from_slice(&v.to_be_bytes());
    *w += 8;
}

fn put_u32(buf: &mut [u8], w: &mut usize, v: u32) {
    buf[*w..*w + 4].copy_from_slice(&v.to_be_bytes());
    *w += 4;
}

fn get_u64(buf: &[u8], r: &mut usize) -> u64 {
    let v = u64::from_be_bytes(buf[*r..*r + 8].try_into().unwrap());
    *r += 8;
    v
}

fn get_u32(buf: &[u8], r: &mut usize) -> u32 {
    let v = u32::from_be_bytes(buf[*r..*r + 4].try_into().unwrap());
    *r += 4;
    v
}
