//! Manual stress run against the process-wide allocator.
//!
//! ```text
//! RUST_LOG=debug MO_POOL_ORDER=21 cargo run --release --example stress -- 20000 4
//! ```
//!
//! The first argument is the number of slots, the second the number of
//! random rounds.

use std::{ptr, time::Instant};

use guardmalloc::GuardAlloc;
use log::info;
use rand::Rng;

#[global_allocator]
static GLOBAL: GuardAlloc = GuardAlloc;

fn arg(n: usize, default: usize) -> usize {
    std::env::args()
        .nth(n)
        .and_then(|a| a.parse().ok())
        .unwrap_or(default)
}

fn main() {
    env_logger::init();
    let slots = arg(1, 10_000);
    let rounds = arg(2, 4);
    let ctx = guardmalloc::context().expect("allocator failed to initialize");
    info!("config: {:?}, page size {}", ctx.config(), ctx.page_size());

    let mut ptrs = vec![ptr::null_mut::<u8>(); slots];

    let start = Instant::now();
    for (i, slot) in ptrs.iter_mut().enumerate() {
        let size = i + 1;
        let p = ctx.allocate_tagged(size, "basic").unwrap().unwrap().as_ptr();
        unsafe {
            *p = 0;
            *p.add(size - 1) = 0;
        }
        ctx.release(p).unwrap();
        *slot = ptr::null_mut();
    }
    info!("basic test passed in {:?}, {:?}", start.elapsed(), ctx.stats());

    let mut rng = rand::thread_rng();
    for round in 0..rounds {
        let start = Instant::now();
        for i in 0..slots {
            let size = rng.gen_range(1..=2 << 20);
            let p = ctx.allocate_tagged(size, "stress").unwrap().unwrap().as_ptr();
            unsafe {
                *p = 0;
                *p.add(size - 1) = 0;
            }
            ptrs[i] = p;
            let k = rng.gen_range(0..=i);
            if !ptrs[k].is_null() {
                ctx.release(ptrs[k]).unwrap();
                ptrs[k] = ptr::null_mut();
            }
        }
        for p in ptrs.iter_mut().filter(|p| !p.is_null()) {
            ctx.release(*p).unwrap();
            *p = ptr::null_mut();
        }
        info!("stress round {round} done in {:?}, {:?}", start.elapsed(), ctx.stats());
    }

    let census = ctx.verify().expect("allocator state is inconsistent");
    info!("passed stress test, {census:?}, purged {}", ctx.purge_cache().unwrap());
}
