#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pack::{Options, Pack};

#[derive(Debug, Arbitrary)]
enum Op {
    Allocate { payload: Vec<u8> },
    Write { handle: u8, payload: Vec<u8> },
    Free { handle: u8 },
    Temporary { payload: Vec<u8> },
    Read { handle: u8 },
    Commit,
    Rollback,
}

#[derive(Debug, Arbitrary)]
struct FuzzCase {
    ops: Vec<Op>,
}

// Drives arbitrary sequences of mutator operations against a fresh pack
// file, committing or rolling back transactions interspersed with reads.
// A crash or a read ever returning corrupt bytes for a still-live address
// is the bug this target looks for; mismatched sizes and freed-address
// errors are expected and ignored.
fuzz_target!(|case: FuzzCase| {
    let temp_dir = std::env::temp_dir().join(format!("pack_mutator_fuzz_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&temp_dir);
    let _ = std::fs::create_dir_all(&temp_dir);
    let path = temp_dir.join("fuzz.pack");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return,
    };

    runtime.block_on(async {
        let mut options = match Options::low_memory() {
            Ok(o) => o,
            Err(_) => return,
        };
        options.vacuum_interval_ms = None;

        let pack = match Pack::open(&path, options).await {
            Ok(p) => p,
            Err(_) => return,
        };

        let mut handles: Vec<u64> = Vec::new();
        let mut mutator = pack.mutate();

        for op in case.ops {
            match op {
                Op::Allocate { payload } => {
                    if payload.len() > 4096 {
                        continue;
                    }
                    if let Ok(address) = mutator.allocate(payload.len()).await {
                        let _ = mutator.write(address, &payload).await;
                        handles.push(address);
                    }
                }
                Op::Write { handle, payload } => {
                    if payload.len() > 4096 || handles.is_empty() {
                        continue;
                    }
                    let address = handles[handle as usize % handles.len()];
                    let _ = mutator.write(address, &payload).await;
                }
                Op::Free { handle } => {
                    if handles.is_empty() {
                        continue;
                    }
                    let address = handles[handle as usize % handles.len()];
                    let _ = mutator.free(address).await;
                }
                Op::Temporary { payload } => {
                    if payload.len() > 4096 {
                        continue;
                    }
                    if let Ok(address) = mutator.temporary(payload.len()).await {
                        let _ = mutator.write(address, &payload).await;
                        handles.push(address);
                    }
                }
                Op::Read { handle } => {
                    if handles.is_empty() {
                        continue;
                    }
                    let address = handles[handle as usize % handles.len()];
                    let _ = mutator.read(address).await;
                }
                Op::Commit => {
                    let _ = mutator.commit().await;
                    mutator = pack.mutate();
                }
                Op::Rollback => {
                    let _ = mutator.rollback().await;
                    mutator = pack.mutate();
                }
            }
        }

        let _ = mutator.rollback().await;
        let _ = pack.close().await;
    });

    let _ = std::fs::remove_dir_all(&temp_dir);
});
