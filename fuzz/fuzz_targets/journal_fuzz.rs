#![no_main]

use libfuzzer_sys::fuzz_target;
use pack::journal::{JournalPage, PAGE_HEADER_LEN};
use pack::sheaf::Sheaf;
use std::sync::Arc;

// Writes arbitrary bytes into a journal page and exercises decode/verify.
// Garbage on disk must surface as an error, never a panic: a real pack file
// never has a "next operation" chain land off the end of a page, but this
// target checks that a corrupted one is rejected instead of walked into a
// buffer overrun.
fuzz_target!(|data: &[u8]| {
    if data.len() < PAGE_HEADER_LEN + 2 || data.len() > 65536 {
        return;
    }

    let temp_dir = std::env::temp_dir().join(format!("pack_journal_fuzz_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&temp_dir);
    let _ = std::fs::create_dir_all(&temp_dir);
    let path = temp_dir.join("fuzz.pack");

    let page_size = data.len().next_power_of_two().max(512) as u32;
    let sheaf = match Sheaf::open(&path, page_size) {
        Ok(s) => Arc::new(s),
        Err(_) => return,
    };

    let write_result = sheaf.with_page_mut(0, |buf| {
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
    });
    if write_result.is_err() {
        return;
    }

    let page = JournalPage::new(&sheaf, 0);
    let verified = page.verify().unwrap_or(false);

    let mut offset = PAGE_HEADER_LEN;
    for _ in 0..64 {
        if offset + 2 > page_size as usize {
            break;
        }
        match page.read_operation(offset) {
            Ok(op) => {
                let advance = op.encoded_len();
                if advance == 0 {
                    break;
                }
                offset += advance;
            }
            Err(_) => break,
        }
    }

    let _ = verified;
    let _ = std::fs::remove_dir_all(&temp_dir);
});
